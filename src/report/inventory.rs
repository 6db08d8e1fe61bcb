use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::tools::convert::STAGING_DIR_NAME;

/// Converted image counts per datatype folder, plus subject/session counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub anat: usize,
    pub func: usize,
    pub dwi: usize,
    pub fmap: usize,
    pub perf: usize,
    pub other: usize,
    pub subjects: usize,
    pub sessions: usize,
}

impl Inventory {
    pub fn total_images(&self) -> usize {
        self.anat + self.func + self.dwi + self.fmap + self.perf + self.other
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() == 1
        && entry.file_type().is_dir()
        && matches!(
            entry.file_name().to_str(),
            Some("derivatives") | Some(STAGING_DIR_NAME)
        )
}

fn is_image(name: &str) -> bool {
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

/// Walks a standardized dataset. Derivatives and converter staging are ignored.
pub fn take_inventory(bids_dir: &Path) -> Inventory {
    let mut inventory = Inventory::default();
    let walker = WalkDir::new(bids_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry))
        .filter_map(Result::ok);

    for entry in walker {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            match entry.depth() {
                1 if name.starts_with("sub-") => inventory.subjects += 1,
                2 if name.starts_with("ses-") => inventory.sessions += 1,
                _ => {}
            }
            continue;
        }
        if !is_image(&name) {
            continue;
        }
        let category = entry
            .path()
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|parent| parent.to_str());
        match category {
            Some("anat") => inventory.anat += 1,
            Some("func") => inventory.func += 1,
            Some("dwi") => inventory.dwi += 1,
            Some("fmap") => inventory.fmap += 1,
            Some("perf") => inventory.perf += 1,
            _ => inventory.other += 1,
        }
    }
    inventory
}
