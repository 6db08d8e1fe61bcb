use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{ToolFailure, ToolRunner};
use crate::classify::naming::{BidsName, NameRegistry, RunCounter};
use crate::classify::{Classification, Datatype, ScanRecord};
use crate::error::Error;
use crate::progress::EventSink;

/// Converter staging folder inside a run directory.
pub const STAGING_DIR_NAME: &str = "tmp_dcm2niix";

/// Extensions that travel together with a sidecar, `.nii.gz` before `.nii`.
const ARTIFACT_EXTENSIONS: [&str; 5] = [".nii.gz", ".nii", ".json", ".bval", ".bvec"];

pub struct ConversionRequest<'a> {
    pub source: &'a Path,
    pub subject: &'a str,
    pub session: &'a str,
    pub staging_dir: &'a Path,
    pub anonymize: bool,
}

/// Turns one session's DICOM folder into image files plus JSON sidecars
/// inside `staging_dir`.
pub trait Converter: Send + Sync {
    fn convert(
        &self,
        request: &ConversionRequest,
        runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure>;
}

pub struct Dcm2niixConverter {
    program: String,
    timeout: Duration,
}

impl Dcm2niixConverter {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
        }
    }

    pub fn arguments(request: &ConversionRequest) -> Vec<OsString> {
        let anonymize = if request.anonymize { "y" } else { "n" };
        let mut args: Vec<OsString> = ["-z", "y", "-b", "y", "-ba", anonymize, "-f", "%s_%p", "-o"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(request.staging_dir.as_os_str().to_os_string());
        args.push(request.source.as_os_str().to_os_string());
        args
    }
}

impl Converter for Dcm2niixConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        fs::create_dir_all(request.staging_dir)?;
        runner.run(
            &self.program,
            &Self::arguments(request),
            Some(self.timeout),
            sink,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedScan {
    pub subject: String,
    pub session: String,
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct OrganizeSummary {
    pub organized: usize,
    pub skipped: Vec<SkippedScan>,
}

/// Staging folder for one subject/session pair.
pub fn staging_dir(run_dir: &Path, subject: &str, session: &str) -> PathBuf {
    run_dir
        .join(STAGING_DIR_NAME)
        .join(format!("sub-{}_ses-{}", subject, session))
}

/// Classifies every sidecar in `staging` and moves its files into
/// `run_dir/sub-X/ses-Y/<datatype>/` under canonical names.
pub fn organize_session(
    staging: &Path,
    run_dir: &Path,
    subject: &str,
    session: &str,
) -> Result<OrganizeSummary, Error> {
    let mut records = read_sidecars(staging)?;
    if records.is_empty() {
        return Err(Error::Other(format!(
            "No valid DICOM series were converted from sub-{} ses-{}",
            subject, session
        )));
    }
    records.sort_by(|a, b| {
        a.series_number
            .unwrap_or(i64::MAX)
            .cmp(&b.series_number.unwrap_or(i64::MAX))
            .then_with(|| a.sidecar_path.cmp(&b.sidecar_path))
    });

    let session_dir = run_dir
        .join(format!("sub-{}", subject))
        .join(format!("ses-{}", session));
    let mut runs = RunCounter::new();
    let mut names = NameRegistry::new();
    let mut summary = OrganizeSummary::default();

    for record in &records {
        let (datatype, name) = match record.classify() {
            Classification::Skip(reason) => {
                debug!("Skipping {} ({})", record.description(), reason);
                summary.skipped.push(SkippedScan {
                    subject: subject.to_string(),
                    session: session.to_string(),
                    description: record.description(),
                    reason: reason.to_string(),
                });
                continue;
            }
            Classification::Scan {
                datatype,
                suffix,
                task,
                direction,
            } => {
                let run = match (&datatype, &task) {
                    (Datatype::Func, Some(task)) => Some(runs.next(subject, session, task)),
                    _ => None,
                };
                let name = BidsName::new(subject, session, suffix)
                    .with_task(task)
                    .with_run(run)
                    .with_direction(direction);
                (datatype, names.reserve(name))
            }
        };

        let dest_dir = session_dir.join(datatype.as_str());
        fs::create_dir_all(&dest_dir)?;
        move_artifacts(staging, &record.file_stem(), &dest_dir, &name.to_string())?;
        summary.organized += 1;
    }

    info!(
        "sub-{} ses-{}: organized {} scans, skipped {}",
        subject,
        session,
        summary.organized,
        summary.skipped.len()
    );
    Ok(summary)
}

fn read_sidecars(staging: &Path) -> Result<Vec<ScanRecord>, Error> {
    if !staging.is_dir() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(staging)?.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
            records.push(ScanRecord::from_sidecar(&path)?);
        }
    }
    Ok(records)
}

fn move_artifacts(staging: &Path, stem: &str, dest_dir: &Path, name: &str) -> Result<(), Error> {
    for ext in ARTIFACT_EXTENSIONS {
        let source = staging.join(format!("{}{}", stem, ext));
        if source.is_file() {
            let target = dest_dir.join(format!("{}{}", name, ext));
            fs::rename(&source, &target)?;
        }
    }
    Ok(())
}
