//! JSONL trace of log mutations, for replay debugging.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const TRACE_RECORDER_FLUSH_EVERY_EVENTS: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    Append {
        action_id: u64,
        pixel_count: usize,
    },
    Undo {
        target_action_id: Option<u64>,
    },
    Redo {
        target_action_id: Option<u64>,
    },
    Ingest {
        action_count: usize,
        pixel_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub schema_version: u32,
    pub event_id: u64,
    pub revision: u64,
    #[serde(flatten)]
    pub kind: MutationKind,
}

pub fn write_mutation_event_line(
    writer: &mut dyn Write,
    event: &MutationEvent,
) -> Result<(), std::io::Error> {
    serde_json::to_writer(&mut *writer, event).map_err(|error| {
        std::io::Error::other(format!("serialize mutation event as JSON failed: {error}"))
    })?;
    writer.write_all(b"\n")
}

pub fn read_mutation_events(
    reader: &mut dyn BufRead,
) -> Result<Vec<MutationEvent>, std::io::Error> {
    let mut events = Vec::new();
    let mut line_buffer = String::new();
    let mut line_number = 0usize;
    loop {
        line_buffer.clear();
        let bytes = reader.read_line(&mut line_buffer)?;
        if bytes == 0 {
            break;
        }
        line_number += 1;
        if line_buffer.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<MutationEvent>(&line_buffer).map_err(|error| {
            std::io::Error::other(format!(
                "parse mutation event JSON at line {line_number} failed: {error}"
            ))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Appends one JSONL event per log mutation. Used only as a debugging aid,
/// so IO failures abort loudly instead of propagating.
pub struct MutationTraceRecorder {
    writer: BufWriter<File>,
    next_event_id: u64,
    pending_events_since_flush: u32,
}

impl MutationTraceRecorder {
    pub fn from_path(path: PathBuf) -> Self {
        let file = File::create(&path).unwrap_or_else(|error| {
            panic!("create mutation trace file '{}': {error}", path.display())
        });
        Self {
            writer: BufWriter::new(file),
            next_event_id: 1,
            pending_events_since_flush: 0,
        }
    }

    pub fn record(&mut self, revision: u64, kind: MutationKind) {
        let event = MutationEvent {
            schema_version: 1,
            event_id: self.next_event_id,
            revision,
            kind,
        };
        self.next_event_id = self
            .next_event_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("mutation trace event id overflow"));
        write_mutation_event_line(&mut self.writer, &event)
            .unwrap_or_else(|error| panic!("write mutation trace event failed: {error}"));
        self.pending_events_since_flush += 1;
        if self.pending_events_since_flush >= TRACE_RECORDER_FLUSH_EVERY_EVENTS {
            self.flush_all();
        }
    }

    fn flush_all(&mut self) {
        if self.pending_events_since_flush == 0 {
            return;
        }
        self.writer
            .flush()
            .unwrap_or_else(|error| panic!("flush mutation trace failed: {error}"));
        self.pending_events_since_flush = 0;
    }
}

impl Drop for MutationTraceRecorder {
    fn drop(&mut self) {
        self.flush_all();
    }
}
