//! Append-only JSONL session event log: structured events are appended to
//! disk for later inspection rather than routed through a `log`/`tracing`
//! subscriber, covering `kiln`'s queue/job vocabulary.
//!
//! # Example
//!
//! ```
//! use kiln_events::{EventLog, EventType, SessionEvent};
//! use kiln_types::QueueStatus;
//! use chrono::Utc;
//!
//! let mut log = EventLog::new();
//!
//! let event = SessionEvent {
//!     timestamp: Utc::now(),
//!     element: "base.bst".to_string(),
//!     event_type: EventType::QueueEnter { queue: "fetch".to_string(), status: QueueStatus::Ready },
//! };
//!
//! log.record(event);
//! assert_eq!(log.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_types::{JobStatus, QueueStatus, ResourceType};
use serde::{Deserialize, Serialize};

/// Default events file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// The events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// The vocabulary of things worth recording about a session: queue
/// transitions, job lifecycle, and scheduler-level milestones: a tagged
/// enum with one variant per notable moment in `kiln`'s pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventType {
    /// An element was classified by a queue's `status()` check.
    QueueEnter { queue: String, status: QueueStatus },
    /// A job was dispatched for an element in a queue.
    JobStarted { queue: String, job_id: u64, attempt: u32 },
    /// A job finished, successfully or not.
    JobFinished { queue: String, job_id: u64, outcome: JobStatus },
    /// A job is being retried after a failed attempt.
    JobRetrying { queue: String, job_id: u64, attempt: u32, delay_ms: u64 },
    /// An element's cache key changed as a result of reverse-dependency
    /// propagation.
    KeyRecomputed { weak: Option<String>, strict: Option<String>, strong: Option<String> },
    /// An artifact was committed to the content store.
    ArtifactCached { key: String, bytes: u64 },
    /// A cached build failure was reported without re-running.
    CachedFailureShortCircuit,
    /// A resource was reserved or released by a job.
    ResourceEvent { resource: ResourceType, in_use: u32, capacity: u32 },
    /// The scheduler received a signal.
    SignalReceived { signal: String },
    /// The scheduler's run loop finished.
    SchedulerFinished { status: String, elapsed_ms: u64 },
}

/// One recorded event: when it happened, which element it's about, and what
/// happened. `element` is `"<session>"` for scheduler-wide events that
/// aren't about a single element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub element: String,
    pub event_type: EventType,
}

/// Append-only event log for a build session.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<SessionEvent>,
}

impl EventLog {
    /// Creates a new empty event log.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records a new event.
    pub fn record(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Writes all recorded events to a file in JSONL format, appending if
    /// the file already exists (so a resumed session's log is continuous).
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Reads all events from a JSONL file; an absent file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from events file {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: SessionEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// All recorded events for a given element name.
    pub fn events_for_element(&self, element: &str) -> Vec<&SessionEvent> {
        self.events.iter().filter(|e| e.element == element).collect()
    }

    /// All recorded events.
    pub fn all_events(&self) -> &[SessionEvent] {
        &self.events
    }

    /// Clears all recorded events from memory (not from disk).
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn sample_event(element: &str) -> SessionEvent {
        SessionEvent {
            timestamp: Utc::now(),
            element: element.to_string(),
            event_type: EventType::QueueEnter { queue: "fetch".to_string(), status: QueueStatus::Ready },
        }
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn record_adds_event_to_log() {
        let mut log = EventLog::new();
        log.record(sample_event("base.bst"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_element_filters_correctly() {
        let mut log = EventLog::new();
        log.record(sample_event("base.bst"));
        log.record(sample_event("mid.bst"));
        log.record(sample_event("base.bst"));

        assert_eq!(log.events_for_element("base.bst").len(), 2);
        assert_eq!(log.events_for_element("mid.bst").len(), 1);
    }

    #[test]
    fn write_to_file_creates_jsonl_format() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event("base.bst"));
        log.write_to_file(&path).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let _: SessionEvent = serde_json::from_str(lines[0]).expect("parse");
    }

    #[test]
    fn write_to_file_appends_to_existing_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log1 = EventLog::new();
        log1.record(sample_event("base.bst"));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = EventLog::new();
        log2.record(sample_event("mid.bst"));
        log2.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn read_from_file_loads_all_events() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event("base.bst"));
        log.record(sample_event("mid.bst"));
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_from_file_returns_empty_log_when_missing() {
        let td = tempdir().expect("tempdir");
        let loaded = EventLog::read_from_file(&td.path().join("nonexistent.jsonl")).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn event_types_roundtrip_through_json() {
        let events = vec![
            EventType::JobStarted { queue: "build".to_string(), job_id: 1, attempt: 1 },
            EventType::JobFinished { queue: "build".to_string(), job_id: 1, outcome: JobStatus::Ok },
            EventType::JobRetrying { queue: "fetch".to_string(), job_id: 2, attempt: 2, delay_ms: 500 },
            EventType::KeyRecomputed { weak: Some("a".into()), strict: None, strong: None },
            EventType::ArtifactCached { key: "a".repeat(64), bytes: 1024 },
            EventType::CachedFailureShortCircuit,
            EventType::ResourceEvent { resource: ResourceType::Process, in_use: 2, capacity: 4 },
            EventType::SignalReceived { signal: "SIGTERM".to_string() },
            EventType::SchedulerFinished { status: "success".to_string(), elapsed_ms: 42 },
        ];

        for event_type in events {
            let event = SessionEvent { timestamp: Utc::now(), element: "x.bst".to_string(), event_type };
            let json = serde_json::to_string(&event).expect("serialize");
            let parsed: SessionEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed.element, event.element);
        }
    }

    #[test]
    fn path_helper_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(events_path(&base), PathBuf::from("x").join(EVENTS_FILE));
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.record(sample_event("base.bst"));
        log.record(sample_event("mid.bst"));
        log.clear();
        assert!(log.is_empty());
    }

    proptest! {
        #[test]
        fn writing_then_reading_preserves_event_count_and_elements(
            elements in proptest::collection::vec("[a-z]{1,8}", 0..20),
        ) {
            let td = tempdir().expect("tempdir");
            let path = td.path().join("events.jsonl");

            let mut log = EventLog::new();
            for element in &elements {
                log.record(sample_event(element));
            }
            log.write_to_file(&path).expect("write");

            let loaded = EventLog::read_from_file(&path).expect("read");
            prop_assert_eq!(loaded.len(), elements.len());
            for element in &elements {
                let expected = elements.iter().filter(|e| *e == element).count();
                prop_assert_eq!(loaded.events_for_element(element).len(), expected);
            }
        }
    }
}
