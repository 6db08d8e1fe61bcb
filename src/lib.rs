pub mod classify;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod tools;

pub use config::AppConfig;
pub use error::Error;
pub use orchestrator::{
    CancellationToken, InputMode, Orchestrator, RunOptions, RunStatus, RunSummary,
};
pub use progress::{EventSink, MarkerWriter, ProgressEvent, SilentReporter};
