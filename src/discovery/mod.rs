//! Maps raw per-subject directory trees onto canonical subject and session ids.

pub mod session_rules;

use crate::error::Error;
use glob::{MatchOptions, Pattern};
use lazy_static::lazy_static;
use session_rules::{match_session, pad_session_id, SessionMatch};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const SUBJECT_PREFIXES: [&str; 4] = ["subject-", "subject", "sub-", "sub"];

lazy_static! {
    static ref DICOM_PATTERNS: Vec<Pattern> = ["*.dcm", "*.ima", "*.dcm.gz"]
        .iter()
        .filter_map(|glob| Pattern::new(glob).ok())
        .collect();
}

/// A subject directory together with its sanitized id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFolder {
    pub path: PathBuf,
    pub subject_id: String,
}

impl SubjectFolder {
    /// `None` when the folder name sanitizes to nothing.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy();
        sanitize_id(&name).map(|subject_id| Self {
            path: path.to_path_buf(),
            subject_id,
        })
    }
}

/// A session folder inside a subject directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFolder {
    pub session_id: String,
    pub path: PathBuf,
}

/// One (subject, session, source) triple ready to become a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub subject_id: String,
    pub session_id: String,
    pub source_path: PathBuf,
}

/// Immediate, non-hidden subdirectories of `root`, sorted by name.
///
/// A missing root yields an empty list. A root that exists but cannot be
/// read is reported as [`Error::Discovery`].
pub fn find_subject_folders(root: &Path) -> Result<Vec<PathBuf>, Error> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(root).map_err(|source| Error::Discovery {
        path: root.to_path_buf(),
        source,
    })?;

    let mut subjects: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .collect();
    subjects.sort();
    Ok(subjects)
}

/// Resolves the session folders of one subject using the ordered rules in
/// [`session_rules::SESSION_RULES`].
///
/// Named rules claim their ids first; unnamed scan folders then take the
/// next free id in encounter order. A folder whose named id is already
/// taken is dropped with a warning. When nothing matches, the subject
/// folder itself becomes session "01".
pub fn find_sessions(subject_path: &Path) -> io::Result<Vec<SessionFolder>> {
    let mut dirs: Vec<(PathBuf, String)> = fs::read_dir(subject_path)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| (entry.path(), entry.file_name().to_string_lossy().into_owned()))
        .filter(|(_, name)| !name.starts_with('.'))
        .collect();
    dirs.sort_by(|a, b| a.1.cmp(&b.1));

    let matched: Vec<(PathBuf, SessionMatch)> = dirs
        .into_iter()
        .filter_map(|(path, name)| {
            let (rule, found) = match_session(&path, &name)?;
            debug!("{} matched session rule '{}'", path.display(), rule);
            Some((path, found))
        })
        .collect();

    let mut taken: HashSet<String> = HashSet::new();
    let mut named: Vec<Option<String>> = Vec::with_capacity(matched.len());
    for (path, found) in &matched {
        match found {
            SessionMatch::Id(id) if !taken.insert(id.clone()) => {
                warn!(
                    "Session folder {} duplicates session id {}; skipping",
                    path.display(),
                    id
                );
                named.push(None);
            }
            SessionMatch::Id(id) => named.push(Some(id.clone())),
            SessionMatch::Sequential => named.push(None),
        }
    }

    let mut next_seq = 1usize;
    let mut sessions = Vec::new();
    for ((path, found), id) in matched.into_iter().zip(named) {
        let session_id = match (found, id) {
            (SessionMatch::Id(_), Some(id)) => id,
            (SessionMatch::Id(_), None) => continue,
            (SessionMatch::Sequential, _) => loop {
                let candidate = pad_session_id(&next_seq.to_string());
                next_seq += 1;
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            },
        };
        sessions.push(SessionFolder { session_id, path });
    }

    if sessions.is_empty() {
        sessions.push(SessionFolder {
            session_id: "01".to_string(),
            path: subject_path.to_path_buf(),
        });
    }
    Ok(sessions)
}

/// Strips one subject prefix and every non-alphanumeric character.
///
/// Returns `None` if nothing is left; callers skip such folders.
pub fn sanitize_id(raw: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    let stripped = SUBJECT_PREFIXES
        .iter()
        .find(|prefix| lower.starts_with(*prefix))
        .map(|prefix| &raw[prefix.len()..])
        .unwrap_or(raw);

    let clean: String = stripped.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// True if a `*.dcm`, `*.ima` or `*.dcm.gz` file (any case) exists at any depth.
pub fn has_dicom_files(path: &Path) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .any(|entry| {
            let name = entry.file_name().to_string_lossy();
            DICOM_PATTERNS
                .iter()
                .any(|pattern| pattern.matches_with(&name, options))
        })
}

/// Subjects and sessions of an existing BIDS dataset (`sub-*/ses-*`).
/// Subjects without session folders get session "01".
pub fn discover_bids_sessions(bids_dir: &Path) -> Result<Vec<SessionEntry>, Error> {
    let mut entries = Vec::new();
    for subject_dir in find_subject_folders(bids_dir)? {
        let name = subject_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(subject_id) = name.strip_prefix("sub-").filter(|id| !id.is_empty()) else {
            continue;
        };

        let mut sessions: Vec<(String, PathBuf)> = fs::read_dir(&subject_dir)?
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("ses-")
                    .filter(|id| !id.is_empty())
                    .map(|id| (id.to_string(), entry.path()))
            })
            .collect();
        sessions.sort();

        if sessions.is_empty() {
            sessions.push(("01".to_string(), subject_dir.clone()));
        }
        for (session_id, source_path) in sessions {
            entries.push(SessionEntry {
                subject_id: subject_id.to_string(),
                session_id,
                source_path,
            });
        }
    }
    Ok(entries)
}
