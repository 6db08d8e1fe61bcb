use lazy_static::lazy_static;
use regex::Regex;

use super::ScanText;

lazy_static! {
    static ref EXPLICIT_TASK: Regex = Regex::new(r"task[-_]([a-z0-9]+)").unwrap();
    static ref RUN_TOKEN: Regex = Regex::new(r"^run\d*$").unwrap();
}

/// Known paradigms, matched against the description with separators removed.
const KNOWN_TASKS: [(&str, &str); 10] = [
    ("rest", "rest"),
    ("memory", "memory"),
    ("movie", "movie"),
    ("music", "music"),
    ("story", "story"),
    ("sound", "sound"),
    ("faces", "faces"),
    ("motor", "motor"),
    ("neurofeedback", "neurofeedback"),
    ("wordpairs", "wordpairs"),
];

const NOISE_TOKENS: [&str; 8] = ["bold", "fmri", "func", "epi", "ep2d", "task", "ap", "pa"];

pub const UNKNOWN_TASK: &str = "unknown";

/// Task label for a functional scan: an explicit `task-<name>`, a known
/// paradigm, the last meaningful word, or "unknown".
pub fn extract_task_label(text: &ScanText) -> String {
    explicit_task(&text.lower)
        .or_else(|| known_task(&text.lower))
        .or_else(|| trailing_word(&text.tokens))
        .unwrap_or_else(|| UNKNOWN_TASK.to_string())
}

fn explicit_task(lower: &str) -> Option<String> {
    EXPLICIT_TASK
        .captures(lower)
        .map(|caps| caps[1].to_string())
}

fn known_task(lower: &str) -> Option<String> {
    let squashed: String = lower
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect();
    KNOWN_TASKS
        .iter()
        .find(|(needle, _)| squashed.contains(needle))
        .map(|(_, label)| label.to_string())
}

// Best effort: the last purely alphabetic token that is not scanner noise.
fn trailing_word(tokens: &[String]) -> Option<String> {
    tokens
        .iter()
        .rev()
        .filter(|t| !NOISE_TOKENS.contains(&t.as_str()))
        .filter(|t| !RUN_TOKEN.is_match(t))
        .find(|t| t.chars().all(|c| c.is_ascii_alphabetic()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(description: &str) -> String {
        extract_task_label(&ScanText::new(description, None))
    }

    #[test]
    fn test_explicit_task_wins() {
        assert_eq!(label("bold_task-motor_rest"), "motor");
        assert_eq!(label("func_task_gambling_run01"), "gambling");
    }

    #[test]
    fn test_known_tasks() {
        assert_eq!(label("BOLD resting state"), "rest");
        assert_eq!(label("fmri_word_pairs"), "wordpairs");
        assert_eq!(label("Neuro-Feedback run 2"), "neurofeedback");
    }

    #[test]
    fn test_trailing_word_heuristic() {
        assert_eq!(label("ep2d_bold_stroop_run1_AP"), "stroop");
        assert_eq!(label("fMRI_nback 2"), "nback");
    }

    #[test]
    fn test_unknown_when_nothing_left() {
        assert_eq!(label("BOLD_run1"), "unknown");
        assert_eq!(label("ep2d_bold_64"), "unknown");
    }
}
