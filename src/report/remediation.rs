const MAX_RAW_ERROR_CHARS: usize = 100;

/// Known causes, matched in order against the lowercased error text.
const REMEDIATIONS: &[(&[&str], &str)] = &[
    (
        &["no such file", "not found"],
        "The input files could not be found. Please check if the DICOM folder exists.",
    ),
    (
        &["permission denied"],
        "The program doesn't have permission to access these files. Check folder permissions.",
    ),
    (
        &["timeout"],
        "The conversion took too long (over 30 minutes). The data might be very large or there may be an issue.",
    ),
    (
        &["no dicom", "no valid"],
        "No valid DICOM files were found in this folder.",
    ),
    (
        &["disk", "space"],
        "Not enough disk space to complete the conversion.",
    ),
    (
        &["memory"],
        "Not enough computer memory (RAM) available.",
    ),
    (
        &["dcm2niix"],
        "The DICOM to NIfTI converter encountered an issue. The scan may be incomplete or corrupted.",
    ),
];

/// Plain-language explanation of a raw error message.
pub fn simplify_error(raw: &str) -> String {
    let lower = raw.to_lowercase();
    for (needles, advice) in REMEDIATIONS {
        if needles.iter().any(|needle| lower.contains(needle)) {
            return advice.to_string();
        }
    }
    if raw.chars().count() > MAX_RAW_ERROR_CHARS {
        let head: String = raw.chars().take(MAX_RAW_ERROR_CHARS).collect();
        return format!("{}... (see detailed error below)", head);
    }
    raw.to_string()
}
