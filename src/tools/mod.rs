//! Running the external conversion and preprocessing programs.

pub mod convert;
pub mod preprocess;

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::progress::EventSink;

pub use convert::{Converter, Dcm2niixConverter};
pub use preprocess::{DockerPreprocessor, PreprocessOptions, Preprocessor};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_LIMIT: Duration = Duration::from_secs(2);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_CHARS: usize = 300;

#[derive(Error, Debug)]
pub enum ToolFailure {
    #[error("{0}: command not found")]
    NotFound(String),

    #[error("{program} exited with code {}: {stderr}", exit_code(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timeout after {} seconds", .limit.as_secs())]
    TimedOut { program: String, limit: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (killed by signal)".to_string())
}

/// Process ids of every external program currently running for a run.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
    }

    fn unregister(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.remove(&pid);
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids
            .lock()
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.lock().map(|pids| pids.is_empty()).unwrap_or(true)
    }

    /// Signals every registered process tree.
    pub fn terminate_all(&self, force: bool) {
        for pid in self.pids() {
            debug!("Terminating process group {} (force: {})", pid, force);
            if let Err(err) = terminate_process_tree(pid, force) {
                warn!("Could not terminate process {}: {}", pid, err);
            }
        }
    }

    /// Polls until no process is registered. Returns false on timeout.
    pub fn wait_until_empty(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
        true
    }
}

/// Runs programs in their own process group and forwards their stdout line
/// by line to an [`EventSink`]. Once the run is cancelled, forwarding stops
/// and the child's process group gets SIGTERM, then SIGKILL after `grace`.
#[derive(Clone)]
pub struct ToolRunner {
    cancel_token: Arc<AtomicBool>,
    registry: ProcessRegistry,
    grace: Duration,
}

impl ToolRunner {
    pub fn new(cancel_token: Arc<AtomicBool>, registry: ProcessRegistry) -> Self {
        Self {
            cancel_token,
            registry,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.load(Ordering::SeqCst)
    }

    pub fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Option<Duration>,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        if self.is_cancelled() {
            return Err(ToolFailure::Cancelled);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        debug!("Running {} {:?}", program, args);
        let mut child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ToolFailure::NotFound(program.to_string()),
            _ => ToolFailure::Io(err),
        })?;
        let pid = child.id();
        self.registry.register(pid);

        let result = self.supervise(&mut child, program, timeout, sink);
        self.registry.unregister(pid);
        result
    }

    fn supervise(
        &self,
        child: &mut Child,
        program: &str,
        timeout: Option<Duration>,
        sink: &dyn EventSink,
    ) -> Result<(), ToolFailure> {
        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let deadline = timeout.map(|limit| Instant::now() + limit);
        // Checked before the first poll so a cancel racing `register` still
        // reaches the child.
        let mut terminated_at: Option<Instant> = None;
        let status = loop {
            if self.is_cancelled() {
                match terminated_at {
                    None => {
                        debug!("Cancelled; terminating {} (pid {})", program, child.id());
                        let _ = terminate_process_tree(child.id(), false);
                        terminated_at = Some(Instant::now());
                    }
                    Some(sent) if sent.elapsed() >= self.grace => {
                        warn!("{} ignored termination; killing", program);
                        let _ = terminate_process_tree(child.id(), true);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ToolFailure::Cancelled);
                    }
                    Some(_) => {}
                }
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => self.forward(&line, sink),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("{} exceeded its time limit; terminating", program);
                let _ = terminate_process_tree(child.id(), true);
                let _ = child.wait();
                return Err(ToolFailure::TimedOut {
                    program: program.to_string(),
                    limit: timeout.unwrap_or_default(),
                });
            }
        };

        let drain_deadline = Instant::now() + DRAIN_LIMIT;
        while let Ok(line) = rx.recv_timeout(drain_deadline.saturating_duration_since(Instant::now())) {
            self.forward(&line, sink);
        }
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        self.finish(program, status, &stderr)
    }

    fn forward(&self, line: &str, sink: &dyn EventSink) {
        if !self.is_cancelled() {
            sink.log(line);
        }
    }

    fn finish(&self, program: &str, status: ExitStatus, stderr: &str) -> Result<(), ToolFailure> {
        if self.is_cancelled() {
            return Err(ToolFailure::Cancelled);
        }
        if status.success() {
            return Ok(());
        }
        Err(ToolFailure::NonZeroExit {
            program: program.to_string(),
            code: status.code(),
            stderr: tail_chars(stderr.trim(), STDERR_TAIL_CHARS),
        })
    }
}

/// Last `limit` characters of `text`.
pub fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn isolate_process_group(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

/// Sends SIGTERM (or SIGKILL when `force`) to the whole process group.
#[cfg(unix)]
pub fn terminate_process_tree(pid: u32, force: bool) -> io::Result<()> {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(windows)]
pub fn terminate_process_tree(pid: u32, force: bool) -> io::Result<()> {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    Command::new("taskkill")
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ééééé", 2), "éé");
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let runner = ToolRunner::new(Arc::new(AtomicBool::new(false)), ProcessRegistry::new());
        let result = runner.run(
            "bidsflow-no-such-program",
            &[],
            None,
            &crate::progress::SilentReporter,
        );
        assert!(matches!(result, Err(ToolFailure::NotFound(_))));
    }

    #[test]
    fn test_cancelled_runner_does_not_spawn() {
        let registry = ProcessRegistry::new();
        let runner = ToolRunner::new(Arc::new(AtomicBool::new(true)), registry.clone());
        let result = runner.run("sh", &[], None, &crate::progress::SilentReporter);
        assert!(matches!(result, Err(ToolFailure::Cancelled)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failure_messages_feed_remediation() {
        let timeout = ToolFailure::TimedOut {
            program: "dcm2niix".into(),
            limit: Duration::from_secs(1800),
        };
        assert_eq!(timeout.to_string(), "dcm2niix timeout after 1800 seconds");
        let missing = ToolFailure::NotFound("dcm2niix".into());
        assert_eq!(missing.to_string(), "dcm2niix: command not found");
    }
}
