use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ErrorKind;

/// Lifecycle and data events an endpoint reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarted,
    ServerStopped,
    ClientConnected,
    ClientDisconnected,
    EndpointReady,
    EndpointClosed,
    DataReceived,
    DataTransmitted,
}

impl EventKind {
    pub fn description(self) -> &'static str {
        match self {
            EventKind::ServerStarted => "Server started",
            EventKind::ServerStopped => "Server stopped",
            EventKind::ClientConnected => "Client connected to the server",
            EventKind::ClientDisconnected => "Client disconnected from the server",
            EventKind::EndpointReady => "Endpoint ready",
            EventKind::EndpointClosed => "Endpoint closed",
            EventKind::DataReceived => "Data have been received",
            EventKind::DataTransmitted => "Data have been transmitted",
        }
    }
}

/// Destination for event log lines.
pub trait LogSink: Send + Sync {
    /// Append one line. The sink adds the trailing newline.
    fn append_line(&self, line: &str) -> io::Result<()>;
}

/// Appends lines to a file, opening it for every write.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append_line(&self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

/// In-memory sink, handy for inspecting what an endpoint logged.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line appended so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn append_line(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}

/// Formats timestamped event lines and hands them to an optional sink.
///
/// Without a sink every call is a no-op.
#[derive(Clone, Default)]
pub struct EventLog {
    sink: Option<Arc<dyn LogSink>>,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self::with_sink(Arc::new(FileSink::new(path)))
    }

    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// `[<unix seconds>] [INFO] <event> (<detail>)`
    pub fn event(&self, event: EventKind, detail: &str) -> io::Result<()> {
        self.append("INFO", event.description(), detail)
    }

    /// `[<unix seconds>] [ERROR] <error> (<detail>)`
    pub fn error(&self, kind: ErrorKind, detail: &str) -> io::Result<()> {
        self.append("ERROR", kind.description(), detail)
    }

    fn append(&self, level: &str, message: &str, detail: &str) -> io::Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        sink.append_line(&format_line(now_unix_seconds(), level, message, detail))
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn format_line(timestamp: u64, level: &str, message: &str, detail: &str) -> String {
    if detail.is_empty() {
        format!("[{timestamp}] [{level}] {message}")
    } else {
        format!("[{timestamp}] [{level}] {message} ({detail})")
    }
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_with_and_without_detail() {
        assert_eq!(
            format_line(12, "INFO", "Server started", ""),
            "[12] [INFO] Server started"
        );
        assert_eq!(
            format_line(12, "ERROR", "Failed to open a socket", "EMFILE"),
            "[12] [ERROR] Failed to open a socket (EMFILE)"
        );
    }

    #[test]
    fn disabled_log_is_noop() {
        let log = EventLog::disabled();
        assert!(!log.is_enabled());
        log.event(EventKind::ServerStarted, "x").unwrap();
    }

    #[test]
    fn memory_sink_collects_lines() {
        let sink = MemorySink::new();
        let log = EventLog::with_sink(Arc::new(sink.clone()));

        log.event(EventKind::DataTransmitted, "TX: 4").unwrap();
        log.error(ErrorKind::Receive, "").unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] Data have been transmitted (TX: 4)"));
        assert!(lines[1].ends_with("[ERROR] Failed to receive a data"));
    }

    #[test]
    fn file_sink_appends() {
        let path = std::env::temp_dir().join(format!(
            "netbase-events-{}-{}.log",
            std::process::id(),
            now_unix_seconds()
        ));
        let log = EventLog::to_file(&path);
        log.event(EventKind::EndpointReady, "").unwrap();
        log.event(EventKind::EndpointClosed, "").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("Endpoint ready"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_sink_failure_surfaces() {
        let log = EventLog::to_file("/nonexistent-netbase-dir/events.log");
        assert!(log.event(EventKind::ServerStarted, "").is_err());
    }
}
