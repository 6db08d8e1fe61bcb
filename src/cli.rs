use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
    /// Interactive progress bar on stderr
    Bars,
    /// Machine-readable [PROGRESS:...] lines on stdout
    Markers,
}

#[derive(Debug, Parser)]
#[command(name = "bidsflow")]
#[command(about = "Convert DICOM sessions to BIDS and run preprocessing", long_about = None)]
pub struct Cli {
    /// Input root holding one folder per subject (or one subject/session with --subject)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Where the timestamped run folder is created
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Preprocess an existing BIDS dataset instead of converting DICOMs
    #[arg(long, conflicts_with_all = ["input", "subject", "session"])]
    pub bids_folder: Option<PathBuf>,

    /// Treat the input as this subject's folder
    #[arg(long)]
    pub subject: Option<String>,

    /// Treat the input as this single session (requires --subject)
    #[arg(long, requires = "subject")]
    pub session: Option<String>,

    /// Skip DICOM to BIDS conversion
    #[arg(long, visible_alias = "skip-bids")]
    pub skip_conversion: bool,

    /// Skip preprocessing
    #[arg(long, visible_alias = "skip-fmriprep")]
    pub skip_preprocess: bool,

    /// Number of concurrent tasks
    #[arg(short, long)]
    pub parallel: Option<usize>,

    /// Strip identifying fields from converted sidecars
    #[arg(long)]
    pub anonymize: bool,

    /// Keep converter staging files
    #[arg(long)]
    pub keep_temp: bool,

    /// Preprocessing options as base64-encoded JSON
    #[arg(long)]
    pub preprocess_opts: Option<String>,

    #[arg(long, value_enum, default_value_t = ProgressMode::Bars)]
    pub progress: ProgressMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_subject_session_mode() {
        let cli = Cli::try_parse_from([
            "bidsflow", "--input", "/data/001/MRI1", "--subject", "001", "--session", "1",
            "--skip-fmriprep", "--progress", "markers",
        ])
        .unwrap();
        assert_eq!(cli.subject.as_deref(), Some("001"));
        assert_eq!(cli.session.as_deref(), Some("1"));
        assert!(cli.skip_preprocess);
        assert_eq!(cli.progress, ProgressMode::Markers);
    }

    #[test]
    fn test_session_requires_subject() {
        assert!(Cli::try_parse_from(["bidsflow", "--input", "/x", "--session", "1"]).is_err());
    }

    #[test]
    fn test_bids_folder_conflicts_with_input() {
        assert!(
            Cli::try_parse_from(["bidsflow", "--input", "/x", "--bids-folder", "/y"]).is_err()
        );
    }
}
