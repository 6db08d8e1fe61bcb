use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

lazy_static! {
    static ref BIDS_SESSION: Regex = Regex::new(r"^ses-(\d+)$").unwrap();
    static ref MRI_SESSION: Regex = Regex::new(r"^mri(\d+)$").unwrap();
    static ref NUMBERED_SESSION: Regex = Regex::new(r"^session[_-]?(\d+)$").unwrap();
    static ref TIMEPOINT_SESSION: Regex = Regex::new(r"^(?:timepoint|tp)[_-]?(\d+)$").unwrap();
}

/// What a session rule decided for one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMatch {
    /// A fixed session id derived from the folder name.
    Id(String),
    /// Looks like scan data but carries no id; gets the next free one.
    Sequential,
}

/// One row of the session naming table. `name` is the raw folder name,
/// `lower` its lowercase form.
pub struct SessionRule {
    pub label: &'static str,
    pub resolve: fn(dir: &Path, name: &str, lower: &str) -> Option<SessionMatch>,
}

/// Evaluated top-down, first match wins.
pub static SESSION_RULES: &[SessionRule] = &[
    SessionRule {
        label: "ses-<digits>",
        resolve: bids_session,
    },
    SessionRule {
        label: "mri<digits>",
        resolve: mri_session,
    },
    SessionRule {
        label: "session[-_]<digits>",
        resolve: numbered_session,
    },
    SessionRule {
        label: "timepoint/tp<digits>",
        resolve: timepoint_session,
    },
    SessionRule {
        label: "baseline/pre/screening",
        resolve: baseline_session,
    },
    SessionRule {
        label: "followup/post",
        resolve: followup_session,
    },
    SessionRule {
        label: "followup2/post2",
        resolve: second_followup_session,
    },
    SessionRule {
        label: "scans",
        resolve: scans_session,
    },
    SessionRule {
        label: "unnamed scan folder",
        resolve: sequential_session,
    },
];

/// Runs the table against one folder.
pub fn match_session(dir: &Path, name: &str) -> Option<(&'static str, SessionMatch)> {
    let lower = name.to_lowercase();
    SESSION_RULES
        .iter()
        .find_map(|rule| (rule.resolve)(dir, name, &lower).map(|m| (rule.label, m)))
}

pub fn pad_session_id(digits: &str) -> String {
    format!("{:0>2}", digits)
}

fn bids_session(_dir: &Path, name: &str, _lower: &str) -> Option<SessionMatch> {
    BIDS_SESSION
        .captures(name)
        .map(|caps| SessionMatch::Id(caps[1].to_string()))
}

fn mri_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    MRI_SESSION
        .captures(lower)
        .map(|caps| SessionMatch::Id(pad_session_id(&caps[1])))
}

fn numbered_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    NUMBERED_SESSION
        .captures(lower)
        .map(|caps| SessionMatch::Id(pad_session_id(&caps[1])))
}

fn timepoint_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    TIMEPOINT_SESSION
        .captures(lower)
        .map(|caps| SessionMatch::Id(pad_session_id(&caps[1])))
}

fn baseline_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    matches!(lower, "baseline" | "pre" | "screening").then(|| SessionMatch::Id("01".into()))
}

fn followup_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    matches!(lower, "followup" | "post" | "followup1").then(|| SessionMatch::Id("02".into()))
}

fn second_followup_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    matches!(lower, "followup2" | "post2").then(|| SessionMatch::Id("03".into()))
}

fn scans_session(_dir: &Path, _name: &str, lower: &str) -> Option<SessionMatch> {
    (lower == "scans").then(|| SessionMatch::Id("01".into()))
}

fn sequential_session(dir: &Path, _name: &str, _lower: &str) -> Option<SessionMatch> {
    looks_like_scan_folder(dir).then_some(SessionMatch::Sequential)
}

/// Nested directories, or any `.dcm`/`.ima`/`.gz` file at any depth.
fn looks_like_scan_folder(dir: &Path) -> bool {
    let has_subdirs = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .any(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false)),
        Err(_) => false,
    };
    if has_subdirs {
        return true;
    }

    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .any(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_lowercase().as_str(), "dcm" | "ima" | "gz"))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id_for(name: &str) -> Option<SessionMatch> {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        match_session(&dir, name).map(|(_, m)| m)
    }

    fn id(value: &str) -> Option<SessionMatch> {
        Some(SessionMatch::Id(value.to_string()))
    }

    #[test]
    fn test_bids_session_keeps_digits_as_given() {
        assert_eq!(id_for("ses-07"), id("07"));
        assert_eq!(id_for("ses-1"), id("1"));
        assert_eq!(id_for("ses-123"), id("123"));
    }

    #[test]
    fn test_bids_session_is_case_sensitive() {
        // "SES-01" is not a BIDS folder and has no data below it
        assert_eq!(id_for("SES-01"), None);
    }

    #[test]
    fn test_mri_session_pads_to_two_digits() {
        assert_eq!(id_for("MRI1"), id("01"));
        assert_eq!(id_for("mri2"), id("02"));
        assert_eq!(id_for("MRI12"), id("12"));
    }

    #[test]
    fn test_numbered_session_variants() {
        assert_eq!(id_for("session3"), id("03"));
        assert_eq!(id_for("session_3"), id("03"));
        assert_eq!(id_for("Session-4"), id("04"));
    }

    #[test]
    fn test_timepoint_variants() {
        assert_eq!(id_for("timepoint1"), id("01"));
        assert_eq!(id_for("tp2"), id("02"));
        assert_eq!(id_for("TP_3"), id("03"));
    }

    #[test]
    fn test_named_visits() {
        assert_eq!(id_for("baseline"), id("01"));
        assert_eq!(id_for("Pre"), id("01"));
        assert_eq!(id_for("screening"), id("01"));
        assert_eq!(id_for("followup"), id("02"));
        assert_eq!(id_for("post"), id("02"));
        assert_eq!(id_for("followup1"), id("02"));
        assert_eq!(id_for("followup2"), id("03"));
        assert_eq!(id_for("post2"), id("03"));
        assert_eq!(id_for("scans"), id("01"));
    }

    #[test]
    fn test_unnamed_folder_with_dicoms_is_sequential() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("visit_a");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("IM0001.IMA"), b"x").unwrap();
        assert_eq!(
            match_session(&dir, "visit_a").map(|(_, m)| m),
            Some(SessionMatch::Sequential)
        );
    }

    #[test]
    fn test_unnamed_folder_with_subdirs_is_sequential() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("visit_b");
        fs::create_dir_all(dir.join("series1")).unwrap();
        assert_eq!(
            match_session(&dir, "visit_b").map(|(_, m)| m),
            Some(SessionMatch::Sequential)
        );
    }

    #[test]
    fn test_unnamed_empty_folder_does_not_match() {
        assert_eq!(id_for("notes"), None);
    }
}
