use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Could not read input directory {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output location {} is not writable: {source}", path.display())]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a valid BIDS folder (missing dataset_description.json): {}", .0.display())]
    InvalidBidsFolder(PathBuf),

    #[error("Invalid preprocessing options: {0}")]
    PreprocessOptions(String),

    #[error("Report error: {0}")]
    Report(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}
