use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{ToolFailure, ToolRunner};
use crate::error::Error;
use crate::progress::EventSink;

const LICENSE_FILE_NAMES: [&str; 2] = [".freesurfer_license.txt", "freesurfer_license.txt"];

/// Options of the preprocessing container, passed on the command line as
/// base64-encoded JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    pub output_spaces: Vec<String>,
    pub fs_reconall: bool,
    pub skip_slice_timing: bool,
    pub use_syn_sdc: bool,
    pub use_aroma: bool,
    pub mem_mb: u32,
    pub nthreads: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            output_spaces: vec!["MNI152NLin2009cAsym".to_string()],
            fs_reconall: false,
            skip_slice_timing: false,
            use_syn_sdc: false,
            use_aroma: false,
            mem_mb: 16000,
            nthreads: 4,
        }
    }
}

impl PreprocessOptions {
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| Error::PreprocessOptions(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| Error::PreprocessOptions(err.to_string()))
    }

    /// Container arguments after the participant label.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec!["--output-spaces".to_string()];
        args.extend(self.output_spaces.iter().cloned());
        if !self.fs_reconall {
            args.push("--fs-no-reconall".to_string());
        }
        if self.skip_slice_timing {
            args.extend(["--ignore".to_string(), "slicetiming".to_string()]);
        }
        if self.use_syn_sdc {
            args.push("--use-syn-sdc".to_string());
        }
        if self.use_aroma {
            args.push("--use-aroma".to_string());
        }
        args.extend([
            "--mem_mb".to_string(),
            self.mem_mb.to_string(),
            "--nthreads".to_string(),
            self.nthreads.to_string(),
            "--omp-nthreads".to_string(),
            self.nthreads.to_string(),
        ]);
        args
    }
}

pub struct PreprocessRequest<'a> {
    pub bids_dir: &'a Path,
    pub output_dir: &'a Path,
    pub subject: &'a str,
}

/// Runs the preprocessing pipeline for one participant of a dataset.
pub trait Preprocessor: Send + Sync {
    fn preprocess(
        &self,
        request: &PreprocessRequest,
        runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure>;
}

pub struct DockerPreprocessor {
    pub runtime: String,
    pub image: String,
    pub license: Option<PathBuf>,
    pub options: PreprocessOptions,
}

impl DockerPreprocessor {
    pub fn arguments(&self, request: &PreprocessRequest, license: &Path) -> Vec<OsString> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/data:ro", to_docker_path(request.bids_dir)),
            "-v".to_string(),
            format!("{}:/out", to_docker_path(request.output_dir)),
            "-v".to_string(),
            format!("{}:/opt/freesurfer/license.txt:ro", to_docker_path(license)),
            self.image.clone(),
            "/data".to_string(),
            "/out".to_string(),
            "participant".to_string(),
            "--participant-label".to_string(),
            request.subject.to_string(),
            "--skip-bids-validation".to_string(),
        ];
        args.extend(self.options.arguments());
        args.into_iter().map(OsString::from).collect()
    }

    fn license_path(&self) -> Result<PathBuf, ToolFailure> {
        find_license(self.license.as_deref()).ok_or_else(|| {
            ToolFailure::Failed(
                "FreeSurfer license file not found. Create .freesurfer_license.txt in the working directory or set freesurfer_license".to_string(),
            )
        })
    }
}

impl Preprocessor for DockerPreprocessor {
    fn preprocess(
        &self,
        request: &PreprocessRequest,
        runner: &ToolRunner,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        let license = self.license_path()?;
        fs::create_dir_all(request.output_dir)?;
        info!(
            "Starting preprocessing for participant {} (spaces: {:?}, reconall: {})",
            request.subject, self.options.output_spaces, self.options.fs_reconall
        );
        runner.run(&self.runtime, &self.arguments(request, &license), None, sink)
    }
}

/// The configured license if it exists, else the first well-known file in
/// the working directory or home directory.
pub fn find_license(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return path.is_file().then(|| path.to_path_buf());
    }
    let mut dirs: Vec<PathBuf> = env::current_dir().into_iter().collect();
    dirs.extend(env::var_os("HOME").map(PathBuf::from));
    dirs.iter()
        .flat_map(|dir| LICENSE_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Host path as the container runtime expects it: `C:\data` becomes `/c/data`.
pub fn to_docker_path(path: &Path) -> String {
    docker_path(&path.to_string_lossy(), cfg!(windows))
}

fn docker_path(path: &str, windows: bool) -> String {
    let bytes = path.as_bytes();
    if windows && bytes.len() > 1 && bytes[1] == b':' {
        let drive = path[..1].to_lowercase();
        return format!("/{}{}", drive, path[2..].replace('\\', "/"));
    }
    path.replace('\\', "/")
}
