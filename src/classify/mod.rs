//! Scan classification: free-text series descriptions to datatype/suffix.

pub mod naming;
pub mod task_label;

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;

const EXCLUDE_KEYWORDS: [&str; 9] = [
    "localizer",
    "scout",
    "survey",
    "calibration",
    "prescan",
    "asset",
    "coil",
    "phoenix",
    "smartbrain",
];
const EXCLUDE_TOKENS: [&str; 2] = ["loc", "cal"];
const T1_KEYWORDS: [&str; 5] = ["t1", "mprage", "spgr", "bravo", "fspgr"];
const T2_KEYWORDS: [&str; 4] = ["t2", "flair", "tse", "fse"];
const FUNC_KEYWORDS: [&str; 2] = ["bold", "fmri"];
const SPIN_ECHO_KEYWORDS: [&str; 7] = [
    "se-epi",
    "seepi",
    "se_epi",
    "spin_echo",
    "spinecho",
    "distortion",
    "topup",
];
const NOT_FUNCTIONAL_EPI: [&str; 4] = ["fieldmap", "field_map", "fmap", "spin-echo"];
const DWI_KEYWORDS: [&str; 4] = ["dwi", "dti", "diffusion", "hardi"];
const FIELDMAP_KEYWORDS: [&str; 6] = [
    "fieldmap",
    "field_map",
    "b0map",
    "phasediff",
    "phase_diff",
    "magnitude",
];
const PERFUSION_KEYWORDS: [&str; 4] = ["asl", "pcasl", "pasl", "perfusion"];

/// Metadata read from one converter JSON sidecar.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ScanRecord {
    #[serde(skip)]
    pub sidecar_path: PathBuf,
    pub series_description: Option<String>,
    pub protocol_name: Option<String>,
    pub modality: Option<String>,
    pub phase_encoding_direction: Option<String>,
    pub series_number: Option<i64>,
}

impl ScanRecord {
    pub fn from_sidecar(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let mut record: ScanRecord = serde_json::from_str(&text).map_err(|err| {
            Error::Other(format!("Unreadable sidecar {}: {}", path.display(), err))
        })?;
        record.sidecar_path = path.to_path_buf();
        Ok(record)
    }

    /// Series description, else protocol name, else the sidecar's file stem.
    pub fn description(&self) -> String {
        self.series_description
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.protocol_name.as_deref().filter(|s| !s.trim().is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| self.file_stem())
    }

    /// Sidecar file name without the `.json` extension.
    pub fn file_stem(&self) -> String {
        self.sidecar_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn classify(&self) -> Classification {
        classify(&self.description(), self.phase_encoding_direction.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Anat,
    Func,
    Dwi,
    Fmap,
    Perf,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Anat => "anat",
            Datatype::Func => "func",
            Datatype::Dwi => "dwi",
            Datatype::Fmap => "fmap",
            Datatype::Perf => "perf",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase-encoding direction of a distortion-correction scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AP,
    PA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AP => f.write_str("AP"),
            Direction::PA => f.write_str("PA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Excluded(&'static str),
    Unrecognized,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Excluded(keyword) => write!(f, "excluded ({})", keyword),
            SkipReason::Unrecognized => f.write_str("unrecognized scan type"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Skip(SkipReason),
    Scan {
        datatype: Datatype,
        suffix: &'static str,
        task: Option<String>,
        direction: Option<Direction>,
    },
}

impl Classification {
    fn scan(datatype: Datatype, suffix: &'static str) -> Self {
        Classification::Scan {
            datatype,
            suffix,
            task: None,
            direction: None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Classification::Skip(_))
    }
}

/// Lowercased description plus its alphanumeric tokens.
pub struct ScanText<'a> {
    pub lower: String,
    pub tokens: Vec<String>,
    pub phase_encoding: Option<&'a str>,
}

impl<'a> ScanText<'a> {
    pub fn new(description: &str, phase_encoding: Option<&'a str>) -> Self {
        let lower = description.to_lowercase();
        let tokens = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            lower,
            tokens,
            phase_encoding,
        }
    }

    fn contains_any(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.lower.contains(k))
    }

    fn has_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    fn has_ap_pa_token(&self) -> bool {
        self.has_token("ap") || self.has_token("pa")
    }
}

pub struct ClassifierRule {
    pub label: &'static str,
    pub apply: fn(&ScanText) -> Option<Classification>,
}

/// Evaluated top-down, first match wins.
pub static CLASSIFIER_RULES: &[ClassifierRule] = &[
    ClassifierRule {
        label: "exclusion",
        apply: exclusion_rule,
    },
    ClassifierRule {
        label: "t1w",
        apply: t1_rule,
    },
    ClassifierRule {
        label: "t2w/flair",
        apply: t2_rule,
    },
    ClassifierRule {
        label: "bold",
        apply: functional_rule,
    },
    ClassifierRule {
        label: "dwi",
        apply: diffusion_rule,
    },
    ClassifierRule {
        label: "spin-echo fieldmap",
        apply: spin_echo_rule,
    },
    ClassifierRule {
        label: "phasediff fieldmap",
        apply: fieldmap_rule,
    },
    ClassifierRule {
        label: "asl",
        apply: perfusion_rule,
    },
];

/// Classifies one scan description. Deterministic for a given input.
pub fn classify(description: &str, phase_encoding: Option<&str>) -> Classification {
    let text = ScanText::new(description, phase_encoding);
    CLASSIFIER_RULES
        .iter()
        .find_map(|rule| {
            let result = (rule.apply)(&text)?;
            debug!("'{}' matched rule {}", description, rule.label);
            Some(result)
        })
        .unwrap_or(Classification::Skip(SkipReason::Unrecognized))
}

fn exclusion_rule(text: &ScanText) -> Option<Classification> {
    EXCLUDE_KEYWORDS
        .iter()
        .find(|k| text.lower.contains(*k))
        .or_else(|| EXCLUDE_TOKENS.iter().find(|t| text.has_token(t)))
        .map(|keyword| Classification::Skip(SkipReason::Excluded(keyword)))
}

fn t1_rule(text: &ScanText) -> Option<Classification> {
    (text.contains_any(&T1_KEYWORDS) && !text.lower.contains("t2"))
        .then(|| Classification::scan(Datatype::Anat, "T1w"))
}

fn t2_rule(text: &ScanText) -> Option<Classification> {
    if !text.contains_any(&T2_KEYWORDS) {
        return None;
    }
    if text.lower.contains("flair") {
        Some(Classification::scan(Datatype::Anat, "FLAIR"))
    } else {
        Some(Classification::scan(Datatype::Anat, "T2w"))
    }
}

fn is_functional(text: &ScanText) -> bool {
    if text.contains_any(&FUNC_KEYWORDS) || text.tokens.iter().any(|t| t.starts_with("func")) {
        return true;
    }
    text.lower.contains("epi")
        && !text.contains_any(&SPIN_ECHO_KEYWORDS)
        && !text.contains_any(&NOT_FUNCTIONAL_EPI)
        && !text.has_ap_pa_token()
}

fn functional_rule(text: &ScanText) -> Option<Classification> {
    is_functional(text).then(|| Classification::Scan {
        datatype: Datatype::Func,
        suffix: "bold",
        task: Some(task_label::extract_task_label(text)),
        direction: None,
    })
}

fn diffusion_rule(text: &ScanText) -> Option<Classification> {
    text.contains_any(&DWI_KEYWORDS)
        .then(|| Classification::scan(Datatype::Dwi, "dwi"))
}

fn spin_echo_rule(text: &ScanText) -> Option<Classification> {
    let spin_echo = text.contains_any(&SPIN_ECHO_KEYWORDS)
        || (text.lower.contains("epi") && text.has_ap_pa_token());
    spin_echo.then(|| Classification::Scan {
        datatype: Datatype::Fmap,
        suffix: "epi",
        task: None,
        direction: phase_direction(text),
    })
}

/// `j-` is anterior-to-posterior, `j` posterior-to-anterior. Falls back
/// to a literal ap/pa token in the description.
fn phase_direction(text: &ScanText) -> Option<Direction> {
    match text.phase_encoding.map(str::trim) {
        Some("j-") => return Some(Direction::AP),
        Some("j") => return Some(Direction::PA),
        _ => {}
    }
    if text.has_token("ap") {
        Some(Direction::AP)
    } else if text.has_token("pa") {
        Some(Direction::PA)
    } else {
        None
    }
}

fn fieldmap_rule(text: &ScanText) -> Option<Classification> {
    text.contains_any(&FIELDMAP_KEYWORDS)
        .then(|| Classification::scan(Datatype::Fmap, "phasediff"))
}

fn perfusion_rule(text: &ScanText) -> Option<Classification> {
    text.contains_any(&PERFUSION_KEYWORDS)
        .then(|| Classification::scan(Datatype::Perf, "asl"))
}
