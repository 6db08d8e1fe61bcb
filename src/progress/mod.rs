//! Progress events, the textual marker protocol, and event sinks.

pub mod estimate;

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

pub use estimate::ProgressState;

lazy_static! {
    static ref MARKER: Regex = Regex::new(r"^\[PROGRESS:([A-Z_]+)(?::(.*))?\]$").unwrap();
}

/// One progress notification. `Display` renders the wire marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Total(usize),
    TaskStart(usize),
    /// Carries the new completed count, not a task id.
    TaskComplete(usize),
    Stage {
        stage: u32,
        total_stages: u32,
        subject: String,
        session: String,
        name: String,
    },
    Status(String),
    Complete,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Total(total) => write!(f, "[PROGRESS:TOTAL:{}]", total),
            ProgressEvent::TaskStart(seq) => write!(f, "[PROGRESS:TASK_START:{}]", seq),
            ProgressEvent::TaskComplete(done) => write!(f, "[PROGRESS:TASK:{}]", done),
            ProgressEvent::Stage {
                stage,
                total_stages,
                subject,
                session,
                name,
            } => write!(
                f,
                "[PROGRESS:STAGE:{}:{}:{}:{}:{}]",
                stage, total_stages, subject, session, name
            ),
            ProgressEvent::Status(text) => write!(f, "[PROGRESS:STATUS:{}]", text),
            ProgressEvent::Complete => write!(f, "[PROGRESS:COMPLETE]"),
        }
    }
}

impl ProgressEvent {
    /// Parses one marker line. Anything else (tool output) yields `None`.
    pub fn parse_marker(line: &str) -> Option<ProgressEvent> {
        let caps = MARKER.captures(line.trim_end())?;
        let payload = caps.get(2).map(|m| m.as_str());
        match (&caps[1], payload) {
            ("TOTAL", Some(n)) => n.parse().ok().map(ProgressEvent::Total),
            ("TASK_START", Some(n)) => n.parse().ok().map(ProgressEvent::TaskStart),
            ("TASK", Some(n)) => n.parse().ok().map(ProgressEvent::TaskComplete),
            ("STAGE", Some(rest)) => {
                let mut parts = rest.splitn(5, ':');
                let stage = parts.next()?.parse().ok()?;
                let total_stages = parts.next()?.parse().ok()?;
                Some(ProgressEvent::Stage {
                    stage,
                    total_stages,
                    subject: parts.next()?.to_string(),
                    session: parts.next()?.to_string(),
                    name: parts.next()?.to_string(),
                })
            }
            ("STATUS", Some(text)) => Some(ProgressEvent::Status(text.to_string())),
            ("COMPLETE", None) => Some(ProgressEvent::Complete),
            _ => None,
        }
    }
}

/// Thread-safe, append-only destination for progress events and forwarded
/// tool output. Shared by every worker of a run.
pub trait EventSink: Send + Sync {
    fn emit(&self, _event: ProgressEvent) {}
    fn log(&self, _line: &str) {}
}

/// Discards everything.
pub struct SilentReporter;

impl EventSink for SilentReporter {}

/// Writes markers and tool output lines to a stream, one per line.
pub struct MarkerWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl MarkerWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    fn write_line(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A closed pipe on the reader side must not take the run down.
        let _ = writeln!(out, "{}", line).and_then(|_| out.flush());
    }
}

impl EventSink for MarkerWriter {
    fn emit(&self, event: ProgressEvent) {
        self.write_line(&event.to_string());
    }

    fn log(&self, line: &str) {
        self.write_line(line);
    }
}

/// Keeps every event and line in memory, in arrival order.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// The completed counts carried by `TaskComplete` events, in order.
    pub fn completed_counts(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::TaskComplete(done) => Some(done),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn log(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stage(stage: u32, total: u32, name: &str) -> ProgressEvent {
        ProgressEvent::Stage {
            stage,
            total_stages: total,
            subject: "001".to_string(),
            session: "02".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_markers_are_bit_exact() {
        assert_eq!(ProgressEvent::Total(3).to_string(), "[PROGRESS:TOTAL:3]");
        assert_eq!(ProgressEvent::TaskStart(0).to_string(), "[PROGRESS:TASK_START:0]");
        assert_eq!(ProgressEvent::TaskComplete(2).to_string(), "[PROGRESS:TASK:2]");
        assert_eq!(
            stage(1, 3, "Converting DICOM to NIfTI").to_string(),
            "[PROGRESS:STAGE:1:3:001:02:Converting DICOM to NIfTI]"
        );
        assert_eq!(
            ProgressEvent::Status("Cancelling...".to_string()).to_string(),
            "[PROGRESS:STATUS:Cancelling...]"
        );
        assert_eq!(ProgressEvent::Complete.to_string(), "[PROGRESS:COMPLETE]");
    }

    #[test]
    fn test_parse_marker_reads_every_kind() {
        let events = vec![
            ProgressEvent::Total(12),
            ProgressEvent::TaskStart(4),
            ProgressEvent::TaskComplete(5),
            stage(2, 3, "Organizing output"),
            ProgressEvent::Status("Processing sub-001: 50%".to_string()),
            ProgressEvent::Complete,
        ];
        for event in events {
            assert_eq!(ProgressEvent::parse_marker(&event.to_string()), Some(event));
        }
    }

    #[test]
    fn test_parse_marker_keeps_colons_in_stage_name() {
        assert_eq!(
            ProgressEvent::parse_marker("[PROGRESS:STAGE:3:3:001:02:Preprocessing: fmriprep]"),
            Some(stage(3, 3, "Preprocessing: fmriprep"))
        );
    }

    #[test]
    fn test_parse_marker_ignores_tool_output() {
        assert_eq!(ProgressEvent::parse_marker("Chris Rorden's dcm2niiX version"), None);
        assert_eq!(ProgressEvent::parse_marker("[PROGRESS:TOTAL:abc]"), None);
        assert_eq!(ProgressEvent::parse_marker("[PROGRESS:UNKNOWN:1]"), None);
        assert_eq!(ProgressEvent::parse_marker("[PROGRESS:COMPLETE:1]"), None);
    }

    #[test]
    fn test_marker_writer_writes_lines() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = Shared::default();
        let writer = MarkerWriter::new(Box::new(buffer.clone()));
        writer.emit(ProgressEvent::Total(2));
        writer.log("converting series 3");
        writer.emit(ProgressEvent::Complete);

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "[PROGRESS:TOTAL:2]\nconverting series 3\n[PROGRESS:COMPLETE]\n"
        );
    }

    #[test]
    fn test_memory_sink_collects_completed_counts() {
        let sink = MemorySink::new();
        sink.emit(ProgressEvent::Total(2));
        sink.emit(ProgressEvent::TaskComplete(1));
        sink.emit(ProgressEvent::TaskComplete(2));
        assert_eq!(sink.completed_counts(), vec![1, 2]);
    }
}
