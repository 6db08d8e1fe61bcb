use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bidsflow::progress::{EventSink, ProgressEvent, ProgressState};

const BAR_UNITS: u64 = 1000;
const TICK: Duration = Duration::from_millis(100);

/// Terminal progress for interactive runs.
///
/// The bar is driven by a [`ProgressState`] so in-flight tasks creep forward
/// between completions. Tool output goes to the log only.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
    state: Arc<Mutex<ProgressState>>,
    ticking: Arc<AtomicBool>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            state: Arc::new(Mutex::new(ProgressState::new())),
            ticking: Arc::new(AtomicBool::new(false)),
        }
    }

    fn start_bar(&self, total: usize) {
        let pb = ProgressBar::new(BAR_UNITS);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} [{bar:30.cyan/dim}] {percent:>3}% {prefix} {msg}",
            )
            .unwrap()
            .progress_chars("━╸─")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        pb.set_prefix(format!("0/{} tasks", total));
        pb.enable_steady_tick(Duration::from_millis(80));

        let mut guard = self.bar.lock().unwrap();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb.clone());
        drop(guard);

        self.ticking.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let ticking = Arc::clone(&self.ticking);
        thread::spawn(move || {
            while ticking.load(Ordering::SeqCst) {
                let fraction = state.lock().unwrap().tick();
                pb.set_position((fraction * BAR_UNITS as f64) as u64);
                thread::sleep(TICK);
            }
        });
    }

    pub fn finish_bar(&self) {
        self.ticking.store(false, Ordering::SeqCst);
        let mut guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }
}

impl EventSink for CliReporter {
    fn emit(&self, event: ProgressEvent) {
        if let ProgressEvent::Total(total) = event {
            self.state.lock().unwrap().apply(&event);
            self.start_bar(total);
            return;
        }

        let (completed, total, stage) = {
            let mut state = self.state.lock().unwrap();
            state.apply(&event);
            (
                state.completed(),
                state.total(),
                state.stage().map(str::to_string),
            )
        };

        match event {
            ProgressEvent::Complete => {
                self.finish_bar();
                eprintln!("  {} All {} tasks finished", style("✓").green(), total);
            }
            ProgressEvent::Status(text) => {
                if let Some(pb) = self.bar.lock().unwrap().as_ref() {
                    pb.println(format!("  {}", text));
                }
            }
            _ => {
                if let Some(pb) = self.bar.lock().unwrap().as_ref() {
                    pb.set_prefix(format!("{}/{} tasks", completed, total));
                    if let Some(stage) = stage {
                        pb.set_message(stage);
                    }
                }
            }
        }
    }
}

impl Drop for CliReporter {
    fn drop(&mut self) {
        self.finish_bar();
    }
}
