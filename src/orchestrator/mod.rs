//! Builds the task list, runs it on a bounded worker pool and owns
//! cancellation and the final report.

pub mod cancel;
pub mod cleanup;
pub mod task;

use chrono::Local;
use dashmap::DashMap;
use std::cell::Cell;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::discovery::{self, session_rules, SessionEntry, SubjectFolder};
use crate::error::Error;
use crate::progress::{EventSink, ProgressEvent};
use crate::report::{self, OverallStatus, Report, RunDetails};
use crate::tools::convert::{self, ConversionRequest, Converter};
use crate::tools::preprocess::{PreprocessRequest, Preprocessor};
use crate::tools::{ProcessRegistry, ToolFailure, ToolRunner};

pub use cancel::{CancellationToken, CleanupHandle, CleanupReport};
pub use task::{ConversionTask, Stage, TaskOutcome};

use task::{StagePlan, STAGE_CONVERTING, STAGE_ORGANIZING, STAGE_PREPROCESSING};

pub const DATASET_DESCRIPTION: &str = "dataset_description.json";
const DERIVATIVES_DIR: &str = "derivatives";

/// Where the tasks come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    /// Every subject folder under the input root.
    All,
    /// The input root is one subject's folder.
    Subject(String),
    /// The input root is one session folder of one subject.
    SubjectSession { subject: String, session: String },
    /// Preprocess an existing standardized dataset; conversion is off.
    BidsFolder(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output_root: PathBuf,
    pub mode: InputMode,
    pub run_conversion: bool,
    pub run_preprocess: bool,
    pub parallelism: usize,
    pub anonymize: bool,
    pub keep_temp: bool,
    pub termination_grace: Duration,
    pub cleanup_retries: u32,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub overall: OverallStatus,
    pub output_dir: PathBuf,
    pub report_path: Option<PathBuf>,
    pub report_text: String,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_tasks: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct SubjectGate {
    pending: usize,
    converted: usize,
}

/// Shared state of one run, borrowed by every worker.
struct RunContext {
    bids_dir: PathBuf,
    derivatives_dir: PathBuf,
    run_conversion: bool,
    stages: StagePlan,
    report: Report,
    runner: ToolRunner,
    gates: DashMap<String, SubjectGate>,
    completed: Mutex<usize>,
    descriptor_created: Mutex<bool>,
}

enum TaskEnd {
    Completed,
    Cancelled,
}

pub struct Orchestrator {
    options: RunOptions,
    converter: Arc<dyn Converter>,
    preprocessor: Arc<dyn Preprocessor>,
    sink: Arc<dyn EventSink>,
    cancel_token: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        options: RunOptions,
        converter: Arc<dyn Converter>,
        preprocessor: Arc<dyn Preprocessor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            options,
            converter,
            preprocessor,
            sink,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token for requesting cancellation from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs every task to completion (or until cancelled) and produces the
    /// report. Only setup problems are returned as errors.
    pub fn run(&self) -> Result<RunSummary, Error> {
        let options = &self.options;
        // Without conversion the input has to be an existing dataset.
        let mode = match &options.mode {
            InputMode::BidsFolder(_) => options.mode.clone(),
            _ if !options.run_conversion => InputMode::BidsFolder(options.input.clone()),
            _ => options.mode.clone(),
        };
        let (run_conversion, bids_dir, owns_bids_dir) = match &mode {
            InputMode::BidsFolder(dir) => {
                if !dir.join(DATASET_DESCRIPTION).is_file() {
                    return Err(Error::InvalidBidsFolder(dir.clone()));
                }
                (false, dir.clone(), false)
            }
            _ => (true, new_run_dir(&options.output_root), true),
        };
        if !run_conversion && !options.run_preprocess {
            return Err(Error::Other(
                "Nothing to do: conversion and preprocessing are both disabled".to_string(),
            ));
        }
        let derivatives_dir = bids_dir.join(DERIVATIVES_DIR);

        let owned_dir = if owns_bids_dir {
            Some(bids_dir.clone())
        } else if options.run_preprocess && !derivatives_dir.exists() {
            Some(derivatives_dir.clone())
        } else {
            None
        };

        let registry = ProcessRegistry::new();
        let run_idle = cancel::Latch::new();
        let attached = self.cancel_token.attach(cancel::CleanupTarget {
            registry: registry.clone(),
            owned_dir,
            run_idle: run_idle.clone(),
            grace: options.termination_grace,
            retries: options.cleanup_retries,
        });
        if !attached {
            info!("Run cancelled before it started");
            return Ok(self.cancelled_before_start(&bids_dir));
        }

        let result = self.run_attached(&mode, run_conversion, bids_dir, derivatives_dir, registry);
        if result.is_err() {
            self.cancel_token.finish_run();
        }
        run_idle.release();
        result
    }

    fn run_attached(
        &self,
        mode: &InputMode,
        run_conversion: bool,
        bids_dir: PathBuf,
        derivatives_dir: PathBuf,
        registry: ProcessRegistry,
    ) -> Result<RunSummary, Error> {
        let options = &self.options;
        if run_conversion {
            fs::create_dir_all(&bids_dir).map_err(|source| Error::OutputNotWritable {
                path: bids_dir.clone(),
                source,
            })?;
        }
        if options.run_preprocess {
            fs::create_dir_all(&derivatives_dir).map_err(|source| Error::OutputNotWritable {
                path: derivatives_dir.clone(),
                source,
            })?;
        }
        let report_dir = if run_conversion {
            bids_dir.clone()
        } else {
            derivatives_dir.clone()
        };

        let report = Report::new(RunDetails {
            input_dir: match mode {
                InputMode::BidsFolder(dir) => dir.clone(),
                _ => options.input.clone(),
            },
            output_dir: report_dir.clone(),
            run_conversion,
            run_preprocess: options.run_preprocess,
            parallelism: options.parallelism.max(1),
        });

        let entries = self.discover(mode, run_conversion, &report)?;
        let tasks = task::build_tasks(entries, run_conversion, options.run_preprocess);
        report.set_total(tasks.len());
        info!("Built {} tasks", tasks.len());

        let gates: DashMap<String, SubjectGate> = DashMap::new();
        for task in &tasks {
            gates.entry(task.subject_id.clone()).or_default().pending += 1;
        }

        let ctx = RunContext {
            bids_dir,
            derivatives_dir,
            run_conversion,
            stages: StagePlan::new(run_conversion, options.run_preprocess),
            report,
            runner: ToolRunner::new(self.cancel_token.flag(), registry)
                .with_grace(options.termination_grace),
            gates,
            completed: Mutex::new(0),
            descriptor_created: Mutex::new(false),
        };

        self.sink.emit(ProgressEvent::Total(tasks.len()));
        self.run_pool(&ctx, &tasks)?;

        if self.cancel_token.finish_run() {
            return Ok(self.finish_cancelled(&ctx));
        }
        self.finish(&ctx, run_conversion, &report_dir)
    }

    /// Subject-major, session-minor session entries for the input mode.
    fn discover(
        &self,
        mode: &InputMode,
        run_conversion: bool,
        report: &Report,
    ) -> Result<Vec<SessionEntry>, Error> {
        let options = &self.options;
        let entries = match mode {
            InputMode::BidsFolder(dir) => match discovery::discover_bids_sessions(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("{}", err);
                    report.add_warning(err.to_string());
                    Vec::new()
                }
            },
            InputMode::All => {
                let subjects = match discovery::find_subject_folders(&options.input) {
                    Ok(subjects) => subjects,
                    Err(err) => {
                        warn!("{}", err);
                        report.add_warning(err.to_string());
                        Vec::new()
                    }
                };
                if subjects.is_empty() {
                    report.add_warning(format!(
                        "No subject folders found in {}",
                        options.input.display()
                    ));
                }
                let mut entries = Vec::new();
                for path in subjects {
                    match SubjectFolder::from_path(&path) {
                        Some(subject) => entries.extend(subject_sessions(&subject, report)),
                        None => {
                            let message = format!(
                                "Skipping folder {}: no usable subject id",
                                path.display()
                            );
                            warn!("{}", message);
                            report.add_warning(message);
                        }
                    }
                }
                entries
            }
            InputMode::Subject(id) => {
                let subject = SubjectFolder {
                    path: options.input.clone(),
                    subject_id: checked_id(id)?,
                };
                subject_sessions(&subject, report)
            }
            InputMode::SubjectSession { subject, session } => {
                let session_id = checked_id(session)?;
                let session_id = if session_id.chars().all(|c| c.is_ascii_digit()) {
                    session_rules::pad_session_id(&session_id)
                } else {
                    session_id
                };
                vec![SessionEntry {
                    subject_id: checked_id(subject)?,
                    session_id,
                    source_path: options.input.clone(),
                }]
            }
        };

        if !run_conversion {
            return Ok(entries);
        }
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let has_dicoms = discovery::has_dicom_files(&entry.source_path);
                if !has_dicoms {
                    let message = format!(
                        "No DICOM files found for subject {} session {} ({}); skipping",
                        entry.subject_id,
                        entry.session_id,
                        entry.source_path.display()
                    );
                    warn!("{}", message);
                    report.add_warning(message);
                }
                has_dicoms
            })
            .collect())
    }

    fn run_pool(&self, ctx: &RunContext, tasks: &[ConversionTask]) -> Result<(), Error> {
        if tasks.is_empty() {
            return Ok(());
        }
        let workers = self.options.parallelism.max(1).min(tasks.len());
        info!("Running {} tasks on {} workers", tasks.len(), workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("bidsflow-worker-{}", index))
            .build()
            .map_err(|err| Error::Other(format!("Could not start worker pool: {}", err)))?;

        pool.scope_fifo(|scope| {
            for task in tasks {
                scope.spawn_fifo(move |_| self.run_task(ctx, task));
            }
        });
        Ok(())
    }

    /// Task boundary: errors and panics become failed outcomes.
    fn run_task(&self, ctx: &RunContext, task: &ConversionTask) {
        if self.cancel_token.is_cancelled() {
            debug!("Not starting task {}: cancelled", task.sequence_number);
            return;
        }
        let gate_released = Cell::new(false);
        let stage = Cell::new(if task.run_conversion {
            Stage::Conversion
        } else {
            Stage::Preprocessing
        });
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute_task(ctx, task, &gate_released, &stage)
        }));

        let failure = match result {
            Ok(Ok(TaskEnd::Completed)) => None,
            Ok(Ok(TaskEnd::Cancelled)) => return,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = failure {
            if self.cancel_token.is_cancelled() {
                return;
            }
            error!(
                "Unexpected error in task for subject {} session {}: {}",
                task.subject_id, task.session_id, message
            );
            ctx.report.add_outcome(TaskOutcome::failed(
                task,
                stage.get(),
                started.elapsed(),
                format!("Unexpected error: {}", message),
            ));
            if !gate_released.get() {
                let last = release_gate(ctx, &task.subject_id, false);
                if task.run_preprocess {
                    let reason = match last {
                        Some(true) => Some("after an unexpected error"),
                        Some(false) => Some("because no session was converted"),
                        None => None,
                    };
                    if let Some(reason) = reason {
                        let message = format!(
                            "Preprocessing for subject {} was skipped {}",
                            task.subject_id, reason
                        );
                        warn!("{}", message);
                        ctx.report.add_warning(message);
                    }
                }
            }
        }
        self.complete_task(ctx);
    }

    fn execute_task(
        &self,
        ctx: &RunContext,
        task: &ConversionTask,
        gate_released: &Cell<bool>,
        stage: &Cell<Stage>,
    ) -> Result<TaskEnd, Error> {
        self.sink.emit(ProgressEvent::TaskStart(task.sequence_number));
        info!(
            "Starting task {}: subject {} session {}",
            task.sequence_number, task.subject_id, task.session_id
        );

        let mut converted = false;
        if task.run_conversion {
            match self.convert_session(ctx, task)? {
                Some(outcome) => {
                    converted = outcome.success;
                    ctx.report.add_outcome(outcome);
                }
                None => return Ok(TaskEnd::Cancelled),
            }
        }
        if self.cancel_token.is_cancelled() {
            return Ok(TaskEnd::Cancelled);
        }

        let preprocess_now = release_gate(ctx, &task.subject_id, converted);
        gate_released.set(true);
        if task.run_preprocess {
            match preprocess_now {
                Some(true) => {
                    stage.set(Stage::Preprocessing);
                    match self.preprocess_subject(ctx, task) {
                        Some(outcome) => ctx.report.add_outcome(outcome),
                        None => return Ok(TaskEnd::Cancelled),
                    }
                }
                Some(false) => {
                    let message = format!(
                        "Preprocessing skipped for subject {}: no session was converted",
                        task.subject_id
                    );
                    warn!("{}", message);
                    ctx.report.add_warning(message);
                }
                None => {}
            }
        }

        Ok(TaskEnd::Completed)
    }

    /// `None` when cancelled mid-way.
    fn convert_session(
        &self,
        ctx: &RunContext,
        task: &ConversionTask,
    ) -> Result<Option<TaskOutcome>, Error> {
        let started = Instant::now();
        self.emit_stage(ctx, task, STAGE_CONVERTING);

        let staging = convert::staging_dir(&ctx.bids_dir, &task.subject_id, &task.session_id);
        let request = ConversionRequest {
            source: &task.source_path,
            subject: &task.subject_id,
            session: &task.session_id,
            staging_dir: &staging,
            anonymize: self.options.anonymize,
        };
        match self.converter.convert(&request, &ctx.runner, self.sink.as_ref()) {
            Ok(()) => {}
            Err(ToolFailure::Cancelled) => return Ok(None),
            Err(failure) => {
                warn!(
                    "Conversion failed for subject {} session {}: {}",
                    task.subject_id, task.session_id, failure
                );
                return Ok(Some(TaskOutcome::failed(
                    task,
                    Stage::Conversion,
                    started.elapsed(),
                    failure.to_string(),
                )));
            }
        }
        if self.cancel_token.is_cancelled() {
            return Ok(None);
        }

        self.emit_stage(ctx, task, STAGE_ORGANIZING);
        match convert::organize_session(&staging, &ctx.bids_dir, &task.subject_id, &task.session_id) {
            Ok(summary) => {
                ctx.report.add_skipped_scans(summary.skipped);
                self.ensure_dataset_description(ctx)?;
                Ok(Some(TaskOutcome::succeeded(
                    task,
                    Stage::Conversion,
                    started.elapsed(),
                )))
            }
            Err(err) => {
                warn!(
                    "Organizing failed for subject {} session {}: {}",
                    task.subject_id, task.session_id, err
                );
                Ok(Some(TaskOutcome::failed(
                    task,
                    Stage::Conversion,
                    started.elapsed(),
                    err.to_string(),
                )))
            }
        }
    }

    /// `None` when cancelled mid-way.
    fn preprocess_subject(&self, ctx: &RunContext, task: &ConversionTask) -> Option<TaskOutcome> {
        let started = Instant::now();
        self.emit_stage(ctx, task, STAGE_PREPROCESSING);
        let request = PreprocessRequest {
            bids_dir: &ctx.bids_dir,
            output_dir: &ctx.derivatives_dir,
            subject: &task.subject_id,
        };
        match self
            .preprocessor
            .preprocess(&request, &ctx.runner, self.sink.as_ref())
        {
            Ok(()) => Some(TaskOutcome::succeeded(
                task,
                Stage::Preprocessing,
                started.elapsed(),
            )),
            Err(ToolFailure::Cancelled) => None,
            Err(failure) => {
                warn!("Preprocessing failed for subject {}: {}", task.subject_id, failure);
                Some(TaskOutcome::failed(
                    task,
                    Stage::Preprocessing,
                    started.elapsed(),
                    failure.to_string(),
                ))
            }
        }
    }

    fn emit_stage(&self, ctx: &RunContext, task: &ConversionTask, name: &'static str) {
        if let Some(stage) = ctx.stages.number(name) {
            self.sink.emit(ProgressEvent::Stage {
                stage,
                total_stages: ctx.stages.total(),
                subject: task.subject_id.clone(),
                session: task.session_id.clone(),
                name: name.to_string(),
            });
        }
    }

    /// Check-then-create under one lock; exactly one task writes the file.
    fn ensure_dataset_description(&self, ctx: &RunContext) -> Result<(), Error> {
        let mut created = lock(&ctx.descriptor_created);
        if *created {
            return Ok(());
        }
        let path = ctx.bids_dir.join(DATASET_DESCRIPTION);
        if !path.exists() {
            let description = serde_json::json!({
                "Name": "fMRI Pipeline Output",
                "BIDSVersion": "1.8.0",
                "DatasetType": "raw",
                "Authors": ["Pipeline"],
            });
            let text = serde_json::to_string_pretty(&description)
                .map_err(|err| Error::Other(err.to_string()))?;
            fs::write(&path, text)?;
            info!("Created {}", path.display());
        }
        *created = true;
        Ok(())
    }

    /// Increments the completed count and publishes it under the same lock.
    fn complete_task(&self, ctx: &RunContext) {
        let mut completed = lock(&ctx.completed);
        *completed += 1;
        self.sink.emit(ProgressEvent::TaskComplete(*completed));
    }

    fn finish(&self, ctx: &RunContext, run_conversion: bool, report_dir: &Path) -> Result<RunSummary, Error> {
        if run_conversion {
            if self.options.keep_temp {
                info!("Keeping temporary files");
            } else {
                let info = cleanup::remove_temporary_files(&ctx.bids_dir);
                ctx.report.set_cleanup_info(info);
            }
            ctx.report.set_inventory(report::take_inventory(&ctx.bids_dir));
        }

        let (report_path, report_text) = ctx.report.write_to(report_dir)?;
        info!("Report written to {}", report_path.display());
        self.sink.emit(ProgressEvent::Complete);

        let counts = ctx.report.counts();
        let status = if counts.failure > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        Ok(RunSummary {
            status,
            overall: ctx.report.status(),
            output_dir: report_dir.to_path_buf(),
            report_path: Some(report_path),
            report_text,
            success_count: counts.success,
            failure_count: counts.failure,
            total_tasks: counts.total,
            elapsed: ctx.report.elapsed(),
        })
    }

    fn finish_cancelled(&self, ctx: &RunContext) -> RunSummary {
        ctx.report.add_warning("The run was cancelled; partial output is being removed");
        let report_text = ctx.report.render();
        info!("Run cancelled. Final report:\n{}", report_text);
        self.sink.emit(ProgressEvent::Status("Cancelled".to_string()));

        let counts = ctx.report.counts();
        RunSummary {
            status: RunStatus::Cancelled,
            overall: ctx.report.status(),
            output_dir: ctx.bids_dir.clone(),
            report_path: None,
            report_text,
            success_count: counts.success,
            failure_count: counts.failure,
            total_tasks: counts.total,
            elapsed: ctx.report.elapsed(),
        }
    }

    fn cancelled_before_start(&self, bids_dir: &Path) -> RunSummary {
        self.sink.emit(ProgressEvent::Status("Cancelled".to_string()));
        RunSummary {
            status: RunStatus::Cancelled,
            overall: OverallStatus::NothingProcessed,
            output_dir: bids_dir.to_path_buf(),
            report_path: None,
            report_text: String::new(),
            success_count: 0,
            failure_count: 0,
            total_tasks: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Marks one of the subject's tasks as past conversion. Returns whether
/// preprocessing should run once the last one is released, `None` before.
fn release_gate(ctx: &RunContext, subject: &str, converted: bool) -> Option<bool> {
    let mut gate = ctx.gates.get_mut(subject)?;
    gate.pending = gate.pending.saturating_sub(1);
    if converted {
        gate.converted += 1;
    }
    (gate.pending == 0).then(|| gate.converted > 0 || !ctx.run_conversion)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn checked_id(raw: &str) -> Result<String, Error> {
    discovery::sanitize_id(raw).ok_or_else(|| Error::Other(format!("Invalid id '{}'", raw)))
}

fn subject_sessions(subject: &SubjectFolder, report: &Report) -> Vec<SessionEntry> {
    match discovery::find_sessions(&subject.path) {
        Ok(sessions) => sessions
            .into_iter()
            .map(|session| SessionEntry {
                subject_id: subject.subject_id.clone(),
                session_id: session.session_id,
                source_path: session.path,
            })
            .collect(),
        Err(err) => {
            let message = format!(
                "Could not read sessions of {}: {}",
                subject.path.display(),
                err
            );
            warn!("{}", message);
            report.add_warning(message);
            Vec::new()
        }
    }
}

/// `<root>/output_<YYYYmmdd_HHMMSS>`, suffixed if that name is taken.
fn new_run_dir(output_root: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let base = output_root.join(format!("output_{}", stamp));
    if !base.exists() {
        return base;
    }
    (2..)
        .map(|n| output_root.join(format!("output_{}_{}", stamp, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked".to_string()
    }
}
