//! Thread-safe aggregation of task outcomes into the run report.

pub mod inventory;
pub mod remediation;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::orchestrator::cleanup::CleanupInfo;
use crate::orchestrator::task::TaskOutcome;
use crate::tools::convert::SkippedScan;

pub use inventory::{take_inventory, Inventory};
pub use remediation::simplify_error;

pub const REPORT_FILE_NAME: &str = "conversion_report.txt";
pub const OUTCOMES_FILE_NAME: &str = "task_outcomes.csv";

const WIDTH: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    FullSuccess,
    PartialSuccess,
    TotalFailure,
    NothingProcessed,
}

impl OverallStatus {
    pub fn from_counts(success: usize, failure: usize, total: usize) -> Self {
        if total == 0 || success + failure == 0 {
            OverallStatus::NothingProcessed
        } else if failure == 0 {
            OverallStatus::FullSuccess
        } else if success == 0 {
            OverallStatus::TotalFailure
        } else {
            OverallStatus::PartialSuccess
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OverallStatus::FullSuccess => "full success",
            OverallStatus::PartialSuccess => "partial success",
            OverallStatus::TotalFailure => "total failure",
            OverallStatus::NothingProcessed => "nothing processed",
        };
        f.write_str(text)
    }
}

/// Per-task success/failure counts. A task fails if any of its outcomes failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub success: usize,
    pub failure: usize,
    pub total: usize,
}

/// Fixed facts about the run shown in the report header and footer.
#[derive(Debug, Clone)]
pub struct RunDetails {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub run_conversion: bool,
    pub run_preprocess: bool,
    pub parallelism: usize,
}

#[derive(Default)]
struct ReportState {
    outcomes: Vec<TaskOutcome>,
    warnings: Vec<String>,
    skipped_scans: Vec<SkippedScan>,
    inventory: Option<Inventory>,
    cleanup: Option<CleanupInfo>,
    total_tasks: usize,
}

#[derive(Serialize)]
struct OutcomeRow<'a> {
    sequence_number: usize,
    subject_id: &'a str,
    session_id: &'a str,
    stage: String,
    success: bool,
    duration_secs: f64,
    error: &'a str,
}

pub struct Report {
    details: RunDetails,
    started_at: DateTime<Local>,
    started: Instant,
    state: Mutex<ReportState>,
}

impl Report {
    pub fn new(details: RunDetails) -> Self {
        Self {
            details,
            started_at: Local::now(),
            started: Instant::now(),
            state: Mutex::new(ReportState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReportState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.state().total_tasks = total;
    }

    pub fn add_outcome(&self, outcome: TaskOutcome) {
        self.state().outcomes.push(outcome);
    }

    pub fn add_warning(&self, message: impl Into<String>) {
        self.state().warnings.push(message.into());
    }

    pub fn add_skipped_scans(&self, scans: impl IntoIterator<Item = SkippedScan>) {
        self.state().skipped_scans.extend(scans);
    }

    pub fn set_inventory(&self, inventory: Inventory) {
        self.state().inventory = Some(inventory);
    }

    pub fn set_cleanup_info(&self, info: CleanupInfo) {
        self.state().cleanup = Some(info);
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.state();
        let mut per_task: BTreeMap<usize, bool> = BTreeMap::new();
        for outcome in &state.outcomes {
            let ok = per_task
                .entry(outcome.task.sequence_number)
                .or_insert(true);
            *ok &= outcome.success;
        }
        let success = per_task.values().filter(|ok| **ok).count();
        TaskCounts {
            success,
            failure: per_task.len() - success,
            total: state.total_tasks,
        }
    }

    pub fn status(&self) -> OverallStatus {
        let counts = self.counts();
        OverallStatus::from_counts(counts.success, counts.failure, counts.total)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Human-readable report from the state accumulated so far.
    pub fn render(&self) -> String {
        let counts = self.counts();
        let status = OverallStatus::from_counts(counts.success, counts.failure, counts.total);
        let elapsed = self.elapsed();
        let finished_at = Local::now();
        let state = self.state();

        let mut lines: Vec<String> = Vec::new();
        banner(&mut lines, &["BIDS CONVERSION REPORT", "fMRI Preprocessing Pipeline"]);
        lines.push(format!(
            "  Generated: {}",
            finished_at.format("%B %d, %Y at %I:%M %p")
        ));
        lines.push(String::new());

        section(&mut lines, "SUMMARY");
        lines.extend(status_box(status).iter().map(|l| l.to_string()));
        lines.push(String::new());
        lines.push(format!("  Scanning sessions processed:  {}", counts.total));
        lines.push(format!("  Successfully converted:       {}", counts.success));
        if counts.failure > 0 {
            lines.push(format!("  Failed (needs attention):     {}", counts.failure));
        }
        if !state.skipped_scans.is_empty() {
            lines.push(format!("  Skipped scans:                {}", state.skipped_scans.len()));
        }
        lines.push(format!("  Total time:                   {}", format_duration(elapsed)));
        if counts.total > 0 {
            let rate = counts.success as f64 / counts.total as f64 * 100.0;
            lines.push(format!("  Success rate:                 {:.0}%", rate));
        }
        lines.push(String::new());

        let mut outcomes: Vec<&TaskOutcome> = state.outcomes.iter().collect();
        outcomes.sort_by(|a, b| {
            (&a.task.subject_id, &a.task.session_id, a.stage as u8)
                .cmp(&(&b.task.subject_id, &b.task.session_id, b.stage as u8))
        });

        if counts.success > 0 {
            section(&mut lines, "YOUR CONVERTED DATA");
            lines.push("  Output location:".to_string());
            lines.push(format!("  {}", self.details.output_dir.display()));
            lines.push(String::new());
            if let Some(inventory) = state.inventory.as_ref().filter(|i| i.total_images() > 0) {
                render_inventory(&mut lines, inventory);
            }
            lines.push("  Sessions that were processed:".to_string());
            lines.push(String::new());
            for outcome in outcomes.iter().filter(|o| o.success) {
                lines.push(format!(
                    "    [OK] Subject {}, Session {}, {} ({})",
                    outcome.task.subject_id,
                    outcome.task.session_id,
                    outcome.stage,
                    format_duration(outcome.duration)
                ));
            }
            lines.push(String::new());
        }

        if counts.failure > 0 {
            section(&mut lines, "PROBLEMS THAT NEED ATTENTION");
            lines.push("  The following sessions could NOT be processed:".to_string());
            lines.push(String::new());
            for outcome in outcomes.iter().filter(|o| !o.success) {
                let raw = outcome.error_message.as_deref().unwrap_or("unknown error");
                lines.push(format!(
                    "    [FAILED] Subject {}, Session {} ({})",
                    outcome.task.subject_id, outcome.task.session_id, outcome.stage
                ));
                lines.push(format!("             What went wrong: {}", simplify_error(raw)));
                lines.push(format!("             Detailed error:  {}", raw));
                lines.push(String::new());
            }
            lines.push("  HOW TO FIX THESE PROBLEMS:".to_string());
            lines.push(String::new());
            lines.push("    1. Check that DICOM files exist in the source folder".to_string());
            lines.push("    2. Make sure the files aren't corrupted (try opening one in a DICOM viewer)".to_string());
            lines.push("    3. Verify you have enough disk space (at least 2x the raw data size)".to_string());
            lines.push("    4. Check the log file for the full tool output".to_string());
            lines.push(String::new());
        }

        if !state.skipped_scans.is_empty() {
            section(&mut lines, "SCANS THAT WERE NOT CONVERTED");
            for scan in &state.skipped_scans {
                lines.push(format!(
                    "    - Subject {}, Session {}: \"{}\" ({})",
                    scan.subject, scan.session, scan.description, scan.reason
                ));
            }
            lines.push(String::new());
        }

        if !state.warnings.is_empty() {
            section(&mut lines, "NOTES AND WARNINGS");
            for warning in &state.warnings {
                lines.push(format!("    - {}", warning));
            }
            lines.push(String::new());
        }

        if counts.success > 0 {
            render_layout(&mut lines);
        }

        render_next_steps(&mut lines, counts, self.details.run_preprocess);

        section(&mut lines, "TECHNICAL DETAILS (for troubleshooting)");
        lines.push(format!("    Source folder:     {}", self.details.input_dir.display()));
        lines.push(format!("    Output folder:     {}", self.details.output_dir.display()));
        lines.push(format!(
            "    Stages:            conversion {}, preprocessing {}",
            on_off(self.details.run_conversion),
            on_off(self.details.run_preprocess)
        ));
        lines.push(format!("    Parallel workers:  {}", self.details.parallelism));
        lines.push(format!(
            "    Started:           {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        ));
        lines.push(format!(
            "    Finished:          {}",
            finished_at.format("%Y-%m-%d %H:%M:%S")
        ));
        lines.push(format!("    Duration:          {}", format_duration(elapsed)));
        if let Some(cleanup) = state.cleanup {
            lines.push(format!(
                "    Temp files cleaned: {} ({:.1} MB)",
                cleanup.files_removed,
                cleanup.bytes_freed as f64 / (1024.0 * 1024.0)
            ));
        }
        lines.push(String::new());

        banner(&mut lines, &["Report generated by bidsflow"]);
        lines.join("\n")
    }

    /// Writes the rendered report and the per-task CSV into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<(PathBuf, String), Error> {
        let text = self.render();
        let report_path = dir.join(REPORT_FILE_NAME);
        fs::write(&report_path, &text)?;
        self.write_outcomes_csv(&dir.join(OUTCOMES_FILE_NAME))?;
        Ok((report_path, text))
    }

    pub fn write_outcomes_csv(&self, path: &Path) -> Result<(), Error> {
        let state = self.state();
        let mut writer = csv::Writer::from_path(path)?;
        for outcome in &state.outcomes {
            writer.serialize(OutcomeRow {
                sequence_number: outcome.task.sequence_number,
                subject_id: &outcome.task.subject_id,
                session_id: &outcome.task.session_id,
                stage: outcome.stage.to_string(),
                success: outcome.success,
                duration_secs: outcome.duration.as_secs_f64(),
                error: outcome.error_message.as_deref().unwrap_or(""),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// `<60s` as "X.X seconds", `<1h` as "M min S sec", else "H hr M min".
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        format!("{:.1} seconds", seconds)
    } else if seconds < 3600.0 {
        let whole = duration.as_secs();
        format!("{} min {} sec", whole / 60, whole % 60)
    } else {
        let whole = duration.as_secs();
        format!("{} hr {} min", whole / 3600, (whole % 3600) / 60)
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn banner(lines: &mut Vec<String>, texts: &[&str]) {
    let inner = WIDTH - 2;
    lines.push(String::new());
    lines.push(format!("+{}+", "=".repeat(inner)));
    for text in texts {
        lines.push(format!("|{:^width$}|", text, width = inner));
    }
    lines.push(format!("+{}+", "=".repeat(inner)));
    lines.push(String::new());
}

fn section(lines: &mut Vec<String>, title: &str) {
    lines.push("-".repeat(WIDTH));
    lines.push(format!("  {}", title));
    lines.push("-".repeat(WIDTH));
    lines.push(String::new());
}

fn status_box(status: OverallStatus) -> [&'static str; 5] {
    const EDGE: &str = "  +---------------------------------------------------------+";
    const BLANK: &str = "  |                                                         |";
    match status {
        OverallStatus::FullSuccess => [
            EDGE,
            BLANK,
            "  |     SUCCESS! All your data was processed correctly.     |",
            BLANK,
            EDGE,
        ],
        OverallStatus::PartialSuccess => [
            EDGE,
            "  |   PARTIAL SUCCESS - Some sessions had problems.         |",
            "  |   Please review the errors below.                       |",
            BLANK,
            EDGE,
        ],
        OverallStatus::TotalFailure => [
            EDGE,
            "  |   CONVERSION FAILED - No data was processed.            |",
            "  |   Please review the errors below for guidance.          |",
            BLANK,
            EDGE,
        ],
        OverallStatus::NothingProcessed => [
            EDGE,
            BLANK,
            "  |   NO DATA PROCESSED - Nothing was found to convert.     |",
            BLANK,
            EDGE,
        ],
    }
}

fn render_inventory(lines: &mut Vec<String>, inventory: &Inventory) {
    lines.push("  What was created:".to_string());
    lines.push(String::new());
    lines.push(format!(
        "    {} brain scan files across {} subjects and {} sessions",
        inventory.total_images(),
        inventory.subjects,
        inventory.sessions
    ));
    let rows = [
        (inventory.anat, "anatomical scans (brain structure images)"),
        (inventory.func, "functional scans (brain activity recordings)"),
        (inventory.dwi, "diffusion scans (white matter imaging)"),
        (inventory.fmap, "fieldmaps (distortion correction images)"),
        (inventory.perf, "perfusion scans (blood flow imaging)"),
        (inventory.other, "other images"),
    ];
    for (count, label) in rows {
        if count > 0 {
            lines.push(format!("      - {} {}", count, label));
        }
    }
    lines.push(String::new());
}

fn render_layout(lines: &mut Vec<String>) {
    section(lines, "UNDERSTANDING YOUR OUTPUT FOLDER");
    const LAYOUT: [&str; 27] = [
        "  Your data is now in 'BIDS format', a standard way to organize brain",
        "  imaging data. Here's what you'll find:",
        "",
        "    dataset_description.json",
        "        A file describing your dataset (required by BIDS)",
        "",
        "    sub-001/                    <- One folder per participant",
        "      ses-01/                   <- One folder per scanning session",
        "        anat/                   <- Structural brain images (T1, T2)",
        "          sub-001_ses-01_T1w.nii.gz     <- Compressed brain image",
        "          sub-001_ses-01_T1w.json       <- Scan parameters",
        "        func/                   <- Functional brain images (BOLD)",
        "          sub-001_ses-01_task-rest_run-01_bold.nii.gz",
        "          sub-001_ses-01_task-rest_run-01_bold.json",
        "",
        "    conversion_report.txt       <- This report file",
        "    task_outcomes.csv           <- One row per task and stage",
        "",
        "  File naming explained:",
        "    - sub-XXX: participant/subject ID",
        "    - ses-YY: session number (01, 02, etc.)",
        "    - task-NAME / run-NN: functional task and repetition",
        "    - T1w, T2w: type of anatomical scan",
        "    - bold: functional MRI data",
        "    - .nii.gz: compressed brain image format",
        "    - .json: metadata about the scan",
        "",
    ];
    lines.extend(LAYOUT.iter().map(|l| l.to_string()));
}

fn render_next_steps(lines: &mut Vec<String>, counts: TaskCounts, preprocessed: bool) {
    section(lines, "WHAT TO DO NEXT");
    let mut step = 1;
    if counts.failure > 0 {
        lines.push(format!(
            "  {}. FIX THE FAILED SESSIONS (see problems section above)",
            step
        ));
        lines.push(String::new());
        step += 1;
    }
    if counts.success > 0 {
        lines.push(format!("  {}. VERIFY YOUR DATA", step));
        lines.push("     Open a few .nii.gz files in a viewer like FSLeyes or ITK-SNAP".to_string());
        lines.push("     to make sure the brain images look correct.".to_string());
        lines.push(String::new());
        step += 1;
        lines.push(format!("  {}. QUALITY CHECK", step));
        lines.push("     Run MRIQC on your data to check image quality.".to_string());
        lines.push("     Website: https://mriqc.readthedocs.io/".to_string());
        lines.push(String::new());
        step += 1;
        if !preprocessed {
            lines.push(format!("  {}. PREPROCESS YOUR DATA", step));
            lines.push("     Run bidsflow again with --bids-folder pointing at this output".to_string());
            lines.push("     to run fMRIPrep on the converted data.".to_string());
            lines.push(String::new());
        }
    }
    if step == 1 {
        lines.push("  Check that the input folder contains subject folders with DICOM files.".to_string());
        lines.push(String::new());
    }
}
