mod cli;
mod reporter;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bidsflow::config::{self, AppConfig};
use bidsflow::orchestrator::{InputMode, Orchestrator, RunOptions, RunStatus, RunSummary};
use bidsflow::progress::{EventSink, MarkerWriter};
use bidsflow::report::format_duration;
use bidsflow::tools::{Dcm2niixConverter, DockerPreprocessor, PreprocessOptions};
use bidsflow::{logging, CancellationToken};
use clap::Parser;
use cli::{Cli, ProgressMode};
use colored::*;
use dotenv::dotenv;
use reporter::CliReporter;
use tracing::{error, info, warn};

const CLEANUP_WAIT_LIMIT: Duration = Duration::from_secs(120);

fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.progress == ProgressMode::Markers);

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("Error: {:#}", err);
            RunStatus::Failed.exit_code()
        }
    };
    drop(_guard);
    process::exit(code);
}

fn run(args: Cli) -> anyhow::Result<i32> {
    let config = config::load_configuration().context("Error loading configuration")?;
    let options = run_options(&args, &config)?;
    let preprocess_options = match &args.preprocess_opts {
        Some(encoded) => PreprocessOptions::from_base64(encoded).unwrap_or_else(|err| {
            warn!("{}; using default preprocessing options", err);
            PreprocessOptions::default()
        }),
        None => PreprocessOptions::default(),
    };

    let converter = Arc::new(Dcm2niixConverter::new(
        &config.converter_program,
        config.conversion_timeout(),
    ));
    let preprocessor = Arc::new(DockerPreprocessor {
        runtime: config.container_runtime.clone(),
        image: config.preprocess_image.clone(),
        license: config.freesurfer_license.clone(),
        options: preprocess_options,
    });

    let cli_reporter = match args.progress {
        ProgressMode::Bars => Some(Arc::new(CliReporter::new())),
        ProgressMode::Markers => None,
    };
    let sink: Arc<dyn EventSink> = match &cli_reporter {
        Some(reporter) => reporter.clone() as Arc<dyn EventSink>,
        None => Arc::new(MarkerWriter::stdout()),
    };

    let orchestrator = Orchestrator::new(options, converter, preprocessor, sink);
    let token = orchestrator.cancellation_token();
    interrupt::watch(token.clone());

    let summary = orchestrator.run()?;
    if let Some(reporter) = &cli_reporter {
        reporter.finish_bar();
    }
    print_summary(&summary);

    if summary.status == RunStatus::Cancelled {
        wait_for_cleanup(&token);
    }
    Ok(summary.status.exit_code())
}

fn run_options(args: &Cli, config: &AppConfig) -> anyhow::Result<RunOptions> {
    let (mode, input) = match (&args.bids_folder, &args.input) {
        (Some(bids), _) => (InputMode::BidsFolder(bids.clone()), bids.clone()),
        (None, Some(input)) => {
            let mode = match (&args.subject, &args.session) {
                (Some(subject), Some(session)) => InputMode::SubjectSession {
                    subject: subject.clone(),
                    session: session.clone(),
                },
                (Some(subject), None) => InputMode::Subject(subject.clone()),
                _ => InputMode::All,
            };
            (mode, input.clone())
        }
        (None, None) => bail!("Either --input or --bids-folder is required"),
    };
    if !input.is_dir() {
        bail!("Input directory does not exist: {}", input.display());
    }

    Ok(RunOptions {
        input,
        output_root: absolute(&args.output_dir),
        mode,
        run_conversion: !args.skip_conversion,
        run_preprocess: !args.skip_preprocess,
        parallelism: args
            .parallel
            .filter(|n| *n > 0)
            .unwrap_or_else(|| config.parallelism()),
        anonymize: args.anonymize,
        keep_temp: args.keep_temp,
        termination_grace: config.termination_grace(),
        cleanup_retries: config.cleanup_retries,
    })
}

fn absolute(path: &Path) -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn print_summary(summary: &RunSummary) {
    let status = match summary.status {
        RunStatus::Succeeded => summary.overall.to_string().to_uppercase().green(),
        RunStatus::Failed => summary.overall.to_string().to_uppercase().red(),
        RunStatus::Cancelled => "CANCELLED".yellow(),
    };
    info!(
        "{}: {} succeeded, {} failed, {} total in {}",
        status,
        format!("{}", summary.success_count).green(),
        format!("{}", summary.failure_count).red(),
        summary.total_tasks,
        format_duration(summary.elapsed).cyan(),
    );
    match &summary.report_path {
        Some(path) => info!("Report: {}", path.display().to_string().cyan()),
        None => info!("No report written"),
    }
}

fn wait_for_cleanup(token: &CancellationToken) {
    let Some(handle) = token.cleanup_handle() else {
        return;
    };
    info!("Waiting for cleanup to finish...");
    match handle.wait_timeout(CLEANUP_WAIT_LIMIT) {
        Some(report) => {
            if let Some(dir) = report.removed {
                info!("Removed {}", dir.display());
            }
            for warning in report.warnings {
                warn!("Cleanup: {}", warning);
            }
        }
        None => warn!("Cleanup still running after {:?}", CLEANUP_WAIT_LIMIT),
    }
}

#[cfg(unix)]
mod interrupt {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use bidsflow::CancellationToken;

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    /// Turns SIGINT/SIGTERM into a cancellation of `token`.
    pub fn watch(token: CancellationToken) {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
        thread::spawn(move || loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                token.cancel();
                return;
            }
            thread::sleep(Duration::from_millis(100));
        });
    }
}

#[cfg(not(unix))]
mod interrupt {
    use bidsflow::CancellationToken;

    pub fn watch(_token: CancellationToken) {}
}
