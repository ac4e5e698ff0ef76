//! Append-only audit event stream.
//!
//! Every block-list mutation and every processed record produces a
//! timestamped [`AuditEvent`]. Events are handed to an [`AuditSink`];
//! the production sink is a FIFO channel drained by a single writer task
//! that appends one line per event to the audit file. Delivery failures
//! are reported through `tracing` and never interrupt ingestion.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Category of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditKind {
    /// IP inserted (or refreshed) in the block list.
    BlockAdded,
    /// IP removed from the block list by an operator.
    BlockRemoved,
    /// Operator asked to remove an IP that was not blocked.
    RemovalOfAbsent,
    /// IP aged out of the block list.
    BlockExpired,
    /// Record without a client IP.
    MalformedRecord,
    /// Record without zone or path.
    InsufficientData,
    /// Per-record IP status.
    Status,
    /// Per-record threat verdict.
    Verdict,
    /// Source exhausted.
    RunCompleted,
    /// Source stopped on a read error.
    RunAborted,
    /// Block list contents at the end of a run.
    BlockListSnapshot,
}

/// A single timestamped audit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub message: String,
}

impl AuditEvent {
    pub fn new(at: DateTime<Utc>, kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            at,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

/// Receiver of audit events.
///
/// Implementations must not block on I/O and must preserve the order in
/// which events are emitted.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Sink that forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiving half of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = %e.0, "Audit writer is gone, dropping event");
        }
    }
}

/// Spawn the task that appends audit events to `path`.
///
/// The task ends once every clone of the returned sink has been dropped
/// and the queue is drained. Must be called from within a tokio runtime.
pub fn spawn_file_writer(path: PathBuf) -> (ChannelAuditSink, JoinHandle<()>) {
    let (sink, rx) = ChannelAuditSink::channel();
    let handle = tokio::spawn(write_events(path, rx));
    (sink, handle)
}

async fn write_events(path: PathBuf, mut rx: mpsc::UnboundedReceiver<AuditEvent>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open audit log");
            None
        }
    };

    let mut written = 0usize;
    while let Some(event) = rx.recv().await {
        let Some(f) = file.as_mut() else {
            // Keep draining so senders never observe a closed channel.
            continue;
        };

        let line = format!("{}\n", event);
        if let Err(e) = f.write_all(line.as_bytes()).await {
            warn!(path = %path.display(), error = %e, "Failed to write audit event");
        } else {
            written += 1;
        }
    }

    if let Some(mut f) = file {
        if let Err(e) = f.flush().await {
            warn!(path = %path.display(), error = %e, "Failed to flush audit log");
        }
    }

    debug!(path = %path.display(), events = written, "Audit writer finished");
}

/// In-memory sink, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events captured so far, in emission order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events of a single kind.
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_event_display() {
        let event = AuditEvent::new(at(), AuditKind::BlockAdded, "IP 1.2.3.4 added to block list");
        assert_eq!(
            event.to_string(),
            "2024-05-01T12:30:00.000Z - IP 1.2.3.4 added to block list"
        );
    }

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemoryAuditSink::new();
        sink.emit(AuditEvent::new(at(), AuditKind::Status, "first"));
        sink.emit(AuditEvent::new(at(), AuditKind::Verdict, "second"));
        sink.emit(AuditEvent::new(at(), AuditKind::Status, "third"));

        let messages: Vec<_> = sink.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(sink.of_kind(AuditKind::Status).len(), 2);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink_closed_receiver_does_not_panic() {
        let (sink, rx) = ChannelAuditSink::channel();
        drop(rx);
        sink.emit(AuditEvent::new(at(), AuditKind::Status, "lost"));
    }

    #[tokio::test]
    async fn test_file_writer_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "existing line\n").unwrap();

        let (sink, handle) = spawn_file_writer(path.clone());
        sink.emit(AuditEvent::new(at(), AuditKind::Status, "IP: 1.1.1.1 - Status: unknown"));
        sink.emit(AuditEvent::new(at(), AuditKind::Verdict, "Allowed: /index.html"));
        drop(sink);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing line");
        assert!(lines[1].ends_with("IP: 1.1.1.1 - Status: unknown"));
        assert!(lines[2].ends_with("Allowed: /index.html"));
    }

    #[tokio::test]
    async fn test_file_writer_unwritable_path_keeps_draining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("audit.log");

        let (sink, handle) = spawn_file_writer(path.clone());
        sink.emit(AuditEvent::new(at(), AuditKind::Status, "dropped"));
        drop(sink);
        handle.await.unwrap();

        assert!(!path.exists());
    }
}
