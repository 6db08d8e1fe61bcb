use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::tools::convert::STAGING_DIR_NAME;

/// What temporary-file cleanup removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupInfo {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

impl CleanupInfo {
    fn add(&mut self, files: usize, bytes: u64) {
        self.files_removed += files;
        self.bytes_freed += bytes;
    }
}

/// Removes converter staging, a stray `.bidsignore` and `*_scans.tsv` files
/// that hold nothing but a header row.
pub fn remove_temporary_files(bids_dir: &Path) -> CleanupInfo {
    let mut info = CleanupInfo::default();

    let staging = bids_dir.join(STAGING_DIR_NAME);
    if staging.is_dir() {
        let (files, bytes) = tree_size(&staging);
        match fs::remove_dir_all(&staging) {
            Ok(()) => info.add(files, bytes),
            Err(err) => warn!("Could not remove {}: {}", staging.display(), err),
        }
    }

    let bidsignore = bids_dir.join(".bidsignore");
    if let Ok(meta) = fs::metadata(&bidsignore) {
        if meta.is_file() && fs::remove_file(&bidsignore).is_ok() {
            info.add(1, meta.len());
        }
    }

    let header_only_scans = WalkDir::new(bids_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with("_scans.tsv"))
        .filter(|entry| is_header_only(entry.path()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    for path in header_only_scans {
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if fs::remove_file(&path).is_ok() {
            debug!("Removed empty scans table {}", path.display());
            info.add(1, size);
        }
    }

    info
}

fn tree_size(dir: &Path) -> (usize, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .fold((0, 0), |(count, bytes), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, bytes + len)
        })
}

fn is_header_only(path: &Path) -> io::Result<bool> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().filter(|line| !line.trim().is_empty()).count() <= 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_removes_temporary_files_only() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        let staging = root.join(STAGING_DIR_NAME).join("sub-001_ses-01");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("leftover.nii.gz"), vec![0u8; 10]).unwrap();
        fs::write(root.join(".bidsignore"), "tmp*\n").unwrap();

        let ses = root.join("sub-001/ses-01");
        fs::create_dir_all(&ses).unwrap();
        fs::write(ses.join("sub-001_ses-01_scans.tsv"), "filename\tacq_time\n").unwrap();
        fs::write(
            root.join("sub-001/sub-001_ses-02_scans.tsv"),
            "filename\tacq_time\nanat/x.nii.gz\t2024\n",
        )
        .unwrap();
        fs::write(ses.join("keep.json"), "{}").unwrap();

        let info = remove_temporary_files(root);
        assert_eq!(info.files_removed, 3);
        assert_eq!(info.bytes_freed, 10 + 5 + 18);
        assert!(!root.join(STAGING_DIR_NAME).exists());
        assert!(!root.join(".bidsignore").exists());
        assert!(!ses.join("sub-001_ses-01_scans.tsv").exists());
        assert!(root.join("sub-001/sub-001_ses-02_scans.tsv").exists());
        assert!(ses.join("keep.json").exists());
    }
}
