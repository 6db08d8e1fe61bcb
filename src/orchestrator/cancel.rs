use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::tools::ProcessRegistry;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const IDLE_WAIT_LIMIT: Duration = Duration::from_secs(60);

/// Blocks until set; used to wait for a run to stop touching its output.
#[derive(Clone, Default)]
pub struct Latch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.inner;
        *lock_or_recover(lock) = true;
        cvar.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *lock_or_recover(&self.inner.0)
    }

    /// Returns false if the latch is still closed after `limit`.
    pub fn wait_timeout(&self, limit: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock_or_recover(lock);
        match cvar.wait_timeout_while(guard, limit, |released| !*released) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock_or_recover(lock);
        drop(cvar.wait_while(guard, |released| !*released));
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Result of the background cleanup after a cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Observes the background cleanup started by [`CancellationToken::cancel`].
/// Every clone refers to the same cleanup.
#[derive(Clone, Default)]
pub struct CleanupHandle {
    done: Latch,
    report: Arc<Mutex<CleanupReport>>,
}

impl CleanupHandle {
    pub fn is_finished(&self) -> bool {
        self.done.is_released()
    }

    pub fn wait(&self) -> CleanupReport {
        self.done.wait();
        lock_or_recover(&self.report).clone()
    }

    pub fn wait_timeout(&self, limit: Duration) -> Option<CleanupReport> {
        self.done
            .wait_timeout(limit)
            .then(|| lock_or_recover(&self.report).clone())
    }

    fn finish(&self, report: CleanupReport) {
        *lock_or_recover(&self.report) = report;
        self.done.release();
    }
}

/// What a cancelled run must tear down.
#[derive(Clone)]
pub struct CleanupTarget {
    pub registry: ProcessRegistry,
    /// Removed after the run goes idle. `None` when the run owns no output.
    pub owned_dir: Option<PathBuf>,
    pub run_idle: Latch,
    pub grace: Duration,
    pub retries: u32,
}

#[derive(Default)]
struct CancelState {
    target: Option<CleanupTarget>,
    handle: Option<CleanupHandle>,
}

/// Cooperative cancellation flag shared between a caller and a run.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    state: Arc<Mutex<CancelState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Sets the flag and starts the cleanup thread. Later calls return the
    /// handle of the first one and do nothing else.
    pub fn cancel(&self) -> CleanupHandle {
        let mut state = lock_or_recover(&self.state);
        if let Some(handle) = &state.handle {
            return handle.clone();
        }
        self.flag.store(true, Ordering::SeqCst);
        info!("Cancellation requested");

        let handle = CleanupHandle::default();
        state.handle = Some(handle.clone());
        match state.target.clone() {
            Some(target) => {
                let worker = handle.clone();
                let spawned = thread::Builder::new()
                    .name("bidsflow-cleanup".to_string())
                    .spawn(move || worker.finish(run_cleanup(target)));
                if let Err(err) = spawned {
                    warn!("Could not start cleanup thread: {}", err);
                    handle.finish(CleanupReport {
                        removed: None,
                        warnings: vec![format!("cleanup thread failed to start: {}", err)],
                    });
                }
            }
            None => handle.finish(CleanupReport::default()),
        }
        handle
    }

    /// The handle of an already requested cancellation.
    pub fn cleanup_handle(&self) -> Option<CleanupHandle> {
        lock_or_recover(&self.state).handle.clone()
    }

    /// Registers what a cancellation must clean up. Fails if cancellation
    /// was already requested, in which case the run must not start.
    pub(crate) fn attach(&self, target: CleanupTarget) -> bool {
        let mut state = lock_or_recover(&self.state);
        if self.is_cancelled() {
            return false;
        }
        state.target = Some(target);
        true
    }

    /// Called once the run is done. Returns true if the run was cancelled;
    /// otherwise the target is dropped so a late cancel deletes nothing.
    pub(crate) fn finish_run(&self) -> bool {
        let mut state = lock_or_recover(&self.state);
        if self.is_cancelled() {
            return true;
        }
        state.target = None;
        false
    }
}

fn run_cleanup(target: CleanupTarget) -> CleanupReport {
    let mut report = CleanupReport::default();

    target.registry.terminate_all(false);
    if !target.registry.wait_until_empty(target.grace) {
        warn!("Processes still running after {:?}; killing", target.grace);
        target.registry.terminate_all(true);
        if !target.registry.wait_until_empty(target.grace) {
            report
                .warnings
                .push("some external processes did not exit".to_string());
        }
    }

    if !target.run_idle.wait_timeout(IDLE_WAIT_LIMIT) {
        report
            .warnings
            .push("run did not stop in time; output may be partially removed".to_string());
    }

    if let Some(dir) = target.owned_dir {
        match remove_dir_with_retry(&dir, target.retries, RETRY_DELAY) {
            Ok(()) => {
                info!("Removed partial output {}", dir.display());
                report.removed = Some(dir);
            }
            Err(err) => {
                warn!("Could not remove {}: {}", dir.display(), err);
                report
                    .warnings
                    .push(format!("could not remove {}: {}", dir.display(), err));
            }
        }
    }
    report
}

/// Deletes `dir` recursively, retrying failed attempts `attempts` times in
/// total. A directory that is already gone counts as removed.
pub fn remove_dir_with_retry(dir: &Path, attempts: u32, delay: Duration) -> io::Result<()> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match fs::remove_dir_all(dir) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                warn!(
                    "Attempt {}/{} to remove {} failed: {}",
                    attempt,
                    attempts,
                    dir.display(),
                    err
                );
                last_err = Some(err);
                if attempt < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "remove failed")))
}
