use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::SessionEntry;

pub const STAGE_CONVERTING: &str = "Converting DICOM to NIfTI";
pub const STAGE_ORGANIZING: &str = "Organizing output";
pub const STAGE_PREPROCESSING: &str = "Preprocessing";

/// One subject/session unit of work. Never mutated after the build phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionTask {
    pub subject_id: String,
    pub session_id: String,
    pub source_path: PathBuf,
    pub sequence_number: usize,
    pub run_conversion: bool,
    pub run_preprocess: bool,
}

/// Numbers the entries in order. Callers pass them subject-major,
/// session-minor.
pub fn build_tasks(
    entries: Vec<SessionEntry>,
    run_conversion: bool,
    run_preprocess: bool,
) -> Vec<ConversionTask> {
    entries
        .into_iter()
        .enumerate()
        .map(|(sequence_number, entry)| ConversionTask {
            subject_id: entry.subject_id,
            session_id: entry.session_id,
            source_path: entry.source_path,
            sequence_number,
            run_conversion,
            run_preprocess,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Conversion,
    Preprocessing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Conversion => f.write_str("conversion"),
            Stage::Preprocessing => f.write_str("preprocessing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task: ConversionTask,
    pub stage: Stage,
    pub success: bool,
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(task: &ConversionTask, stage: Stage, duration: Duration) -> Self {
        Self {
            task: task.clone(),
            stage,
            success: true,
            duration,
            error_message: None,
        }
    }

    pub fn failed(task: &ConversionTask, stage: Stage, duration: Duration, error: String) -> Self {
        Self {
            task: task.clone(),
            stage,
            success: false,
            duration,
            error_message: Some(error),
        }
    }
}

/// Stage markers of one run. Only enabled stages are numbered.
#[derive(Debug, Clone)]
pub struct StagePlan {
    names: Vec<&'static str>,
}

impl StagePlan {
    pub fn new(run_conversion: bool, run_preprocess: bool) -> Self {
        let mut names = Vec::new();
        if run_conversion {
            names.extend([STAGE_CONVERTING, STAGE_ORGANIZING]);
        }
        if run_preprocess {
            names.push(STAGE_PREPROCESSING);
        }
        Self { names }
    }

    pub fn total(&self) -> u32 {
        self.names.len() as u32
    }

    /// 1-based position of `name`, if that stage is enabled.
    pub fn number(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|index| index as u32 + 1)
    }
}
