use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use bidsflow::orchestrator::DATASET_DESCRIPTION;
use bidsflow::progress::{MemorySink, ProgressEvent};
use bidsflow::report::{OverallStatus, OUTCOMES_FILE_NAME, REPORT_FILE_NAME};
use bidsflow::tools::convert::{ConversionRequest, Converter, STAGING_DIR_NAME};
use bidsflow::tools::preprocess::{PreprocessRequest, Preprocessor};
use bidsflow::tools::{ToolFailure, ToolRunner};
use bidsflow::{Error, EventSink, InputMode, Orchestrator, RunOptions, RunStatus};

/// Writes a T1 and a resting-state sidecar pair per session; fails for the
/// listed subjects the way a crashing converter would.
#[derive(Default)]
struct FakeConverter {
    failing_subjects: HashSet<String>,
    calls: AtomicUsize,
}

impl Converter for FakeConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        _runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_subjects.contains(request.subject) {
            return Err(ToolFailure::Failed(
                "dcm2niix exited with code 1: corrupt input".to_string(),
            ));
        }
        fs::create_dir_all(request.staging_dir)?;
        for (stem, description, series) in [("2_t1", "T1_MPRAGE", 2), ("5_rest", "BOLD_task-rest", 5)] {
            fs::write(
                request.staging_dir.join(format!("{}.json", stem)),
                format!(
                    r#"{{"SeriesDescription":"{}","SeriesNumber":{}}}"#,
                    description, series
                ),
            )?;
            fs::write(request.staging_dir.join(format!("{}.nii.gz", stem)), b"nifti")?;
        }
        sink.log("Conversion required 0.1 seconds");
        Ok(())
    }
}

#[derive(Default)]
struct FakePreprocessor {
    subjects: Mutex<Vec<String>>,
}

impl FakePreprocessor {
    fn subjects(&self) -> Vec<String> {
        let mut subjects = self.subjects.lock().unwrap().clone();
        subjects.sort();
        subjects
    }
}

impl Preprocessor for FakePreprocessor {
    fn preprocess(
        &self,
        request: &PreprocessRequest,
        _runner: &ToolRunner,
        _sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        self.subjects.lock().unwrap().push(request.subject.to_string());
        let out = request.output_dir.join(format!("sub-{}", request.subject));
        fs::create_dir_all(&out)?;
        fs::write(out.join("done.txt"), "ok")?;
        Ok(())
    }
}

/// Panics for one session and behaves like [`FakeConverter`] otherwise.
#[derive(Default)]
struct PanickingConverter {
    inner: FakeConverter,
}

impl Converter for PanickingConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        if request.subject == "001" && request.session == "02" {
            panic!("sidecar parser exploded");
        }
        self.inner.convert(request, runner, sink)
    }
}

/// Blocks inside conversion until the run is cancelled.
#[derive(Default)]
struct BlockingConverter {
    started: AtomicUsize,
}

impl Converter for BlockingConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        runner: &ToolRunner,
        _sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        self.started.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(request.staging_dir)?;
        let deadline = Instant::now() + Duration::from_secs(30);
        while !runner.is_cancelled() {
            if Instant::now() > deadline {
                return Err(ToolFailure::Failed("never cancelled".to_string()));
            }
            thread::sleep(Duration::from_millis(20));
        }
        Err(ToolFailure::Cancelled)
    }
}

fn touch_dicom(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("IM0001.dcm"), b"DICM").unwrap();
}

/// Layout:
///   input/
///     001/MRI1/IM0001.dcm
///     001/MRI2/IM0001.dcm
///     002/baseline/IM0001.dcm
fn create_input(root: &Path) {
    touch_dicom(&root.join("001/MRI1"));
    touch_dicom(&root.join("001/MRI2"));
    touch_dicom(&root.join("002/baseline"));
}

fn options(input: &Path, output_root: &Path, mode: InputMode) -> RunOptions {
    RunOptions {
        input: input.to_path_buf(),
        output_root: output_root.to_path_buf(),
        mode,
        run_conversion: true,
        run_preprocess: true,
        parallelism: 2,
        anonymize: false,
        keep_temp: false,
        termination_grace: Duration::from_millis(500),
        cleanup_retries: 3,
    }
}

fn run_dirs(output_root: &Path) -> Vec<PathBuf> {
    fs::read_dir(output_root)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[test]
fn test_partial_failure_pipeline() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    let output_root = tmp.path().join("out");
    create_input(&input);
    fs::create_dir_all(&output_root).unwrap();

    let converter = Arc::new(FakeConverter {
        failing_subjects: ["002".to_string()].into_iter().collect(),
        ..FakeConverter::default()
    });
    let preprocessor = Arc::new(FakePreprocessor::default());
    let sink = Arc::new(MemorySink::new());

    let orchestrator = Orchestrator::new(
        options(&input, &output_root, InputMode::All),
        converter.clone(),
        preprocessor.clone(),
        sink.clone(),
    );
    let summary = orchestrator.run().unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.status.exit_code(), 1);
    assert_eq!(summary.overall, OverallStatus::PartialSuccess);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.failure_count, 1);
    assert_eq!(summary.total_tasks, 3);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 3);

    // Subject 001 is preprocessed once, after both sessions; 002 never.
    assert_eq!(preprocessor.subjects(), vec!["001".to_string()]);

    let run_dir = summary.output_dir.clone();
    assert_eq!(run_dirs(&output_root), vec![run_dir.clone()]);
    assert!(run_dir.join(DATASET_DESCRIPTION).is_file());
    for ses in ["ses-01", "ses-02"] {
        let ses_dir = run_dir.join("sub-001").join(ses);
        assert!(ses_dir
            .join(format!("anat/sub-001_{}_T1w.nii.gz", ses))
            .is_file());
        assert!(ses_dir
            .join(format!("func/sub-001_{}_task-rest_run-01_bold.json", ses))
            .is_file());
    }
    assert!(!run_dir.join("sub-002").exists());
    assert!(!run_dir.join(STAGING_DIR_NAME).exists());
    assert!(run_dir.join("derivatives/sub-001/done.txt").is_file());

    let report = fs::read_to_string(run_dir.join(REPORT_FILE_NAME)).unwrap();
    assert_eq!(report, summary.report_text);
    assert!(report.contains("PARTIAL SUCCESS"));
    assert!(report.contains("corrupt input"));
    assert!(run_dir.join(OUTCOMES_FILE_NAME).is_file());

    let description: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join(DATASET_DESCRIPTION)).unwrap())
            .unwrap();
    assert_eq!(description["BIDSVersion"], "1.8.0");
}

#[test]
fn test_completed_counts_are_monotonic() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    let output_root = tmp.path().join("out");
    create_input(&input);
    touch_dicom(&input.join("003/MRI1"));
    touch_dicom(&input.join("004/MRI1"));

    let sink = Arc::new(MemorySink::new());
    let mut opts = options(&input, &output_root, InputMode::All);
    opts.run_preprocess = false;
    opts.parallelism = 4;
    let summary = Orchestrator::new(
        opts,
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        sink.clone(),
    )
    .run()
    .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.overall, OverallStatus::FullSuccess);
    assert_eq!(sink.completed_counts(), vec![1, 2, 3, 4, 5]);

    let events = sink.events();
    assert_eq!(events.first(), Some(&ProgressEvent::Total(5)));
    assert_eq!(events.last(), Some(&ProgressEvent::Complete));
    assert!(events.iter().all(|event| match event {
        ProgressEvent::Stage { total_stages, .. } => *total_stages == 2,
        _ => true,
    }));
    assert!(sink
        .lines()
        .iter()
        .any(|line| line.contains("Conversion required")));
}

#[test]
fn test_panicking_task_is_contained() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    let output_root = tmp.path().join("out");
    create_input(&input);

    let preprocessor = Arc::new(FakePreprocessor::default());
    let sink = Arc::new(MemorySink::new());
    let mut opts = options(&input, &output_root, InputMode::All);
    opts.parallelism = 1;
    let summary = Orchestrator::new(
        opts,
        Arc::new(PanickingConverter::default()),
        preprocessor.clone(),
        sink.clone(),
    )
    .run()
    .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.failure_count, 1);
    assert_eq!(sink.completed_counts(), vec![1, 2, 3]);

    // 001/02 panicked as the subject's last session, so only 002 reaches
    // preprocessing.
    assert_eq!(preprocessor.subjects(), vec!["002".to_string()]);
    assert!(summary.report_text.contains("Unexpected error: sidecar parser exploded"));
    assert!(summary
        .report_text
        .contains("Preprocessing for subject 001 was skipped after an unexpected error"));
    assert!(summary.output_dir.join("sub-001/ses-01").is_dir());
    assert!(summary.output_dir.join("sub-002/ses-01").is_dir());
}

#[test]
fn test_subject_session_mode_pads_session() {
    let tmp = tempdir().unwrap();
    let session = tmp.path().join("scans");
    let output_root = tmp.path().join("out");
    touch_dicom(&session);

    let mut opts = options(
        &session,
        &output_root,
        InputMode::SubjectSession {
            subject: "sub-007".to_string(),
            session: "3".to_string(),
        },
    );
    opts.run_preprocess = false;
    let summary = Orchestrator::new(
        opts,
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    )
    .run()
    .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert!(summary
        .output_dir
        .join("sub-007/ses-03/anat/sub-007_ses-03_T1w.nii.gz")
        .is_file());
}

#[test]
fn test_bids_folder_mode_only_preprocesses() {
    let tmp = tempdir().unwrap();
    let bids = tmp.path().join("bids");
    fs::create_dir_all(bids.join("sub-001/ses-01/anat")).unwrap();
    fs::create_dir_all(bids.join("sub-001/ses-02/anat")).unwrap();
    fs::create_dir_all(bids.join("sub-002/anat")).unwrap();
    fs::write(bids.join(DATASET_DESCRIPTION), "{}").unwrap();

    let converter = Arc::new(FakeConverter::default());
    let preprocessor = Arc::new(FakePreprocessor::default());
    let summary = Orchestrator::new(
        options(&bids, &tmp.path().join("unused"), InputMode::BidsFolder(bids.clone())),
        converter.clone(),
        preprocessor.clone(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        preprocessor.subjects(),
        vec!["001".to_string(), "002".to_string()]
    );
    assert_eq!(summary.output_dir, bids.join("derivatives"));
    assert!(bids.join("derivatives").join(REPORT_FILE_NAME).is_file());
    assert!(!tmp.path().join("unused").exists());
}

#[test]
fn test_bids_folder_without_description_is_rejected() {
    let tmp = tempdir().unwrap();
    let bids = tmp.path().join("bids");
    fs::create_dir_all(bids.join("sub-001")).unwrap();

    let result = Orchestrator::new(
        options(&bids, tmp.path(), InputMode::BidsFolder(bids.clone())),
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    )
    .run();
    assert!(matches!(result, Err(Error::InvalidBidsFolder(_))));
}

#[test]
fn test_nothing_to_process_succeeds_with_warning() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    fs::create_dir_all(input.join("001/MRI1")).unwrap();
    fs::write(input.join("001/MRI1/notes.txt"), "no images").unwrap();

    let summary = Orchestrator::new(
        options(&input, &tmp.path().join("out"), InputMode::All),
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    )
    .run()
    .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.overall, OverallStatus::NothingProcessed);
    assert_eq!(summary.total_tasks, 0);
    assert!(summary.report_text.contains("No DICOM files found"));
}

#[test]
fn test_cancel_removes_run_dir_and_starts_nothing_new() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    let output_root = tmp.path().join("out");
    create_input(&input);
    fs::create_dir_all(&output_root).unwrap();

    let converter = Arc::new(BlockingConverter::default());
    let mut opts = options(&input, &output_root, InputMode::All);
    opts.parallelism = 1;
    let orchestrator = Orchestrator::new(
        opts,
        converter.clone(),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    );
    let token = orchestrator.cancellation_token();

    let worker = thread::spawn(move || orchestrator.run());
    let deadline = Instant::now() + Duration::from_secs(10);
    while converter.started.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "conversion never started");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(run_dirs(&output_root).len(), 1);

    let handle = token.cancel();
    let summary = worker.join().unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.status.exit_code(), 130);
    assert!(summary.report_path.is_none());

    let cleanup = handle.wait_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(cleanup.removed, Some(summary.output_dir.clone()));
    assert!(run_dirs(&output_root).is_empty());
    assert_eq!(converter.started.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_before_run_creates_nothing() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    let output_root = tmp.path().join("out");
    create_input(&input);
    fs::create_dir_all(&output_root).unwrap();

    let converter = Arc::new(FakeConverter::default());
    let orchestrator = Orchestrator::new(
        options(&input, &output_root, InputMode::All),
        converter.clone(),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    );
    orchestrator.cancellation_token().cancel();

    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
    assert!(run_dirs(&output_root).is_empty());
}

#[test]
fn test_skip_conversion_treats_input_as_dataset() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    create_input(&input);

    let mut opts = options(&input, &tmp.path().join("out"), InputMode::All);
    opts.run_conversion = false;
    let result = Orchestrator::new(
        opts,
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    )
    .run();
    assert!(matches!(result, Err(Error::InvalidBidsFolder(path)) if path == input));
}

#[test]
fn test_both_stages_disabled_is_rejected() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    create_input(&input);

    let mut opts = options(&input, &tmp.path().join("out"), InputMode::All);
    opts.run_preprocess = false;
    opts.run_conversion = true;
    let bids = tmp.path().join("bids");
    fs::create_dir_all(&bids).unwrap();
    fs::write(bids.join(DATASET_DESCRIPTION), "{}").unwrap();
    opts.mode = InputMode::BidsFolder(bids);

    let result = Orchestrator::new(
        opts,
        Arc::new(FakeConverter::default()),
        Arc::new(FakePreprocessor::default()),
        Arc::new(MemorySink::new()),
    )
    .run();
    assert!(matches!(result, Err(Error::Other(_))));
}
