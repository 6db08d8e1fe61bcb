use std::collections::{HashMap, HashSet};
use std::fmt;

use super::Direction;

/// Canonical file label: `sub-<s>_ses-<s>[_task-<t>][_run-<nn>][_dir-<d>]_<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BidsName {
    pub subject: String,
    pub session: String,
    pub task: Option<String>,
    pub run: Option<u32>,
    pub direction: Option<Direction>,
    pub suffix: String,
}

impl BidsName {
    pub fn new(subject: &str, session: &str, suffix: &str) -> Self {
        Self {
            subject: subject.to_string(),
            session: session.to_string(),
            task: None,
            run: None,
            direction: None,
            suffix: suffix.to_string(),
        }
    }

    pub fn with_task(mut self, task: Option<String>) -> Self {
        self.task = task;
        self
    }

    pub fn with_run(mut self, run: Option<u32>) -> Self {
        self.run = run;
        self
    }

    pub fn with_direction(mut self, direction: Option<Direction>) -> Self {
        self.direction = direction;
        self
    }
}

impl fmt::Display for BidsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}_ses-{}", self.subject, self.session)?;
        if let Some(task) = &self.task {
            write!(f, "_task-{}", task)?;
        }
        if let Some(run) = self.run {
            write!(f, "_run-{:02}", run)?;
        }
        if let Some(direction) = self.direction {
            write!(f, "_dir-{}", direction)?;
        }
        write!(f, "_{}", self.suffix)
    }
}

/// Hands out run indices per (subject, session, task), starting at 1.
#[derive(Debug, Default)]
pub struct RunCounter {
    counters: HashMap<(String, String, String), u32>,
}

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, subject: &str, session: &str, task: &str) -> u32 {
        let counter = self
            .counters
            .entry((subject.to_string(), session.to_string(), task.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Tracks names already written in one session so non-functional scans
/// never overwrite each other.
#[derive(Debug, Default)]
pub struct NameRegistry {
    taken: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `name`, or the first free `run-02`, `run-03`, ... variant.
    pub fn reserve(&mut self, name: BidsName) -> BidsName {
        if self.taken.insert(name.to_string()) {
            return name;
        }
        let mut run = 2;
        loop {
            let candidate = name.clone().with_run(Some(run));
            if self.taken.insert(candidate.to_string()) {
                return candidate;
            }
            run += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_order_is_fixed() {
        let name = BidsName::new("001", "01", "bold")
            .with_direction(Some(Direction::PA))
            .with_run(Some(3))
            .with_task(Some("rest".to_string()));
        assert_eq!(name.to_string(), "sub-001_ses-01_task-rest_run-03_dir-PA_bold");
    }

    #[test]
    fn test_minimal_name() {
        assert_eq!(
            BidsName::new("7", "02", "T1w").to_string(),
            "sub-7_ses-02_T1w"
        );
    }

    #[test]
    fn test_run_counter_is_gapless_per_task() {
        let mut counter = RunCounter::new();
        let rest: Vec<u32> = (0..3).map(|_| counter.next("001", "01", "rest")).collect();
        assert_eq!(rest, vec![1, 2, 3]);
        assert_eq!(counter.next("001", "01", "motor"), 1);
        assert_eq!(counter.next("001", "02", "rest"), 1);
        assert_eq!(counter.next("001", "01", "rest"), 4);
    }

    #[test]
    fn test_name_registry_adds_run_on_collision() {
        let mut names = NameRegistry::new();
        let first = names.reserve(BidsName::new("001", "01", "T1w"));
        let second = names.reserve(BidsName::new("001", "01", "T1w"));
        let third = names.reserve(BidsName::new("001", "01", "T1w"));
        assert_eq!(first.to_string(), "sub-001_ses-01_T1w");
        assert_eq!(second.to_string(), "sub-001_ses-01_run-02_T1w");
        assert_eq!(third.to_string(), "sub-001_ses-01_run-03_T1w");
    }
}
