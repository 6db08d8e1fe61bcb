use super::ProgressEvent;

/// Share of a task's slice an in-flight task may reach before it completes.
pub const IN_FLIGHT_CAP: f64 = 0.95;
const EASE_FACTOR: f64 = 0.02;
const MIN_STEP: f64 = 0.001;

/// Caller-side progress estimate fed by [`ProgressEvent`]s.
///
/// `completed` never decreases. While tasks are in flight the displayed
/// fraction eases towards a target that stops short of the next whole task;
/// a `TaskComplete` snaps it to `completed / total`.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    total: usize,
    completed: usize,
    current: f64,
    target: f64,
    stage: Option<String>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Displayed overall fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        self.current
    }

    /// Label of the last stage marker seen, e.g. `sub-001 ses-01: Preprocessing`.
    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    /// Progress beyond the completed tasks, in task units, capped below one task.
    pub fn in_flight_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let done = self.completed as f64;
        (self.current * self.total as f64 - done).clamp(0.0, IN_FLIGHT_CAP)
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Total(total) => {
                *self = ProgressState {
                    total: *total,
                    ..ProgressState::default()
                };
            }
            ProgressEvent::TaskStart(_) => {
                self.raise_target(IN_FLIGHT_CAP);
            }
            ProgressEvent::Stage {
                stage,
                total_stages,
                subject,
                session,
                name,
            } => {
                if *total_stages > 0 {
                    let share = *stage as f64 / *total_stages as f64 * IN_FLIGHT_CAP;
                    self.raise_target(share);
                }
                self.stage = Some(format!("sub-{} ses-{}: {}", subject, session, name));
            }
            ProgressEvent::TaskComplete(done) => {
                self.completed = self.completed.max(*done);
                if self.total > 0 {
                    self.completed = self.completed.min(self.total);
                    self.current = self.completed as f64 / self.total as f64;
                    self.target = self.target.max(self.current);
                }
            }
            ProgressEvent::Complete => {
                self.completed = self.total;
                self.current = 1.0;
                self.target = 1.0;
            }
            ProgressEvent::Status(_) => {}
        }
    }

    /// Advances the animation one step and returns the new fraction.
    pub fn tick(&mut self) -> f64 {
        if self.current < self.target {
            let step = ((self.target - self.current) * EASE_FACTOR).max(MIN_STEP);
            self.current = (self.current + step).min(self.target);
        }
        self.current
    }

    fn raise_target(&mut self, task_share: f64) {
        if self.total == 0 {
            return;
        }
        let target = (self.completed as f64 + task_share) / self.total as f64;
        self.target = self.target.max(target.min(1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(total: usize) -> ProgressState {
        let mut state = ProgressState::new();
        state.apply(&ProgressEvent::Total(total));
        state.apply(&ProgressEvent::TaskStart(0));
        state
    }

    #[test]
    fn test_in_flight_never_reaches_full_task() {
        let mut state = started(2);
        for _ in 0..10_000 {
            state.tick();
        }
        assert!(state.fraction() <= 0.95 / 2.0 + 1e-9);
        assert!(state.in_flight_fraction() <= IN_FLIGHT_CAP);
        assert!(state.fraction() > 0.4);
    }

    #[test]
    fn test_task_complete_snaps_exactly() {
        let mut state = started(4);
        state.tick();
        state.apply(&ProgressEvent::TaskComplete(1));
        assert_eq!(state.completed(), 1);
        assert_eq!(state.fraction(), 0.25);
    }

    #[test]
    fn test_completed_is_monotonic() {
        let mut state = started(3);
        state.apply(&ProgressEvent::TaskComplete(2));
        state.apply(&ProgressEvent::TaskComplete(1));
        assert_eq!(state.completed(), 2);
    }

    #[test]
    fn test_tick_moves_at_least_min_step() {
        let mut state = started(1);
        let before = state.fraction();
        let after = state.tick();
        assert!(after - before >= MIN_STEP - 1e-12);
    }

    #[test]
    fn test_stage_records_label() {
        let mut state = started(1);
        state.apply(&ProgressEvent::Stage {
            stage: 2,
            total_stages: 3,
            subject: "001".into(),
            session: "01".into(),
            name: "Organizing output".into(),
        });
        assert_eq!(state.stage(), Some("sub-001 ses-01: Organizing output"));
    }

    #[test]
    fn test_complete_is_full() {
        let mut state = started(5);
        state.apply(&ProgressEvent::Complete);
        assert_eq!(state.fraction(), 1.0);
        assert_eq!(state.completed(), 5);
    }
}
