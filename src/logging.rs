use std::env;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Sets up stdout + file logging. When `console_to_stderr` is set the
/// console layer moves to stderr so stdout stays reserved for progress markers.
pub fn init_logger(console_to_stderr: bool) -> impl Drop {
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter_layer = EnvFilter::new(filter);

    let log_file_path =
        env::var("LOG_FILE_PATH").unwrap_or_else(|_| "./logs/bidsflow.log".to_string());

    let file_appender = tracing_appender::rolling::never("./", log_file_path);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = if console_to_stderr {
        fmt::layer()
            .with_writer(std::io::stderr)
            .pretty()
            .with_file(false)
            .without_time()
            .with_ansi(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stdout)
            .pretty()
            .with_file(false)
            .without_time()
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(filter_layer)
        .init();

    info!("Tracing is configured for console and file logging.");

    guard
}
