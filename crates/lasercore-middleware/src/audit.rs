//! Append-only audit sinks.
//!
//! The core does not own audit storage; it hands each record to an
//! [`AuditSink`]. Two sinks ship with the crate: [`MemoryAuditSink`] for tests
//! and short sessions, and [`JsonLinesAuditSink`], which appends one JSON
//! object per line to a file and flushes after every record.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use lasercore_types::Event;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for durable audit records.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &Event) -> Result<(), AuditError>;
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<Event>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record appended so far, oldest first.
    pub fn records(&self) -> Vec<Event> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: &Event) -> Result<(), AuditError> {
        self.records.lock().push(event.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// JSON lines file
// ────────────────────────────────────────────────────────────────────────────

pub struct JsonLinesAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesAuditSink {
    /// Open `path` for appending, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn append(&self, event: &Event) -> Result<(), AuditError> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasercore_types::{EventPayload, SafetyState, TransitionCause, OperatorCommand};

    fn transition() -> Event {
        Event::new(
            "lasercore-kernel::monitor",
            EventPayload::SafetyStateChanged {
                from: SafetyState::Armed,
                to: SafetyState::EmergencyStop,
                cause: TransitionCause::Command {
                    command: OperatorCommand::EmergencyStop,
                },
            },
        )
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        let a = transition();
        let b = transition();
        sink.append(&a).unwrap();
        sink.append(&b).unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, a.id);
        assert_eq!(records[1].id, b.id);
    }

    #[test]
    fn json_lines_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let first = transition();
        JsonLinesAuditSink::open(&path).unwrap().append(&first).unwrap();
        let second = transition();
        JsonLinesAuditSink::open(&path).unwrap().append(&second).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Event> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
    }

    #[test]
    fn open_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("audit.jsonl");
        assert!(matches!(
            JsonLinesAuditSink::open(&path),
            Err(AuditError::Io { .. })
        ));
    }
}
