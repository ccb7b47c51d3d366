//! Decoded trace events and their derived identities.
//!
//! This module provides:
//! - [`TraceEvent`], one decoded trace record as delivered by an external reader
//! - [`EventIndex`], the `(timestamp, differentiator)` identity used for ordering
//!   and deduplication within one source segment
//! - The stable event identifier handed to sinks
//! - The buffered event line format used by file-backed sinks
//!
//! # Timestamp Encoding
//!
//! Timestamps are persisted in two forms: a binary form (nanoseconds since the
//! Unix epoch, as a signed 128-bit integer) that is parsed back, and a human
//! form (RFC 3339) that is only written for easier debugging. The binary form is
//! lossless over the whole `DateTime<Utc>` range, so a persisted watermark
//! compares equal to the event it was taken from.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between an event type and an identifier suffix that some
/// producers append to it (e.g. `ReplicaOpen@7f3a`).
pub const EVENT_TYPE_SUFFIX_SEPARATOR: char = '@';

/// One decoded trace record.
///
/// Only `timestamp`, `task_name`, `event_type` and `level` drive ingestion
/// decisions. The remaining fields are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Source-segment-local wall clock time of the event.
    pub timestamp: DateTime<Utc>,

    /// Severity. Lower is more severe: 0 = silent .. 5 = noise.
    pub level: u8,

    /// Thread that emitted the event.
    #[serde(default)]
    pub thread_id: u32,

    /// Process that emitted the event.
    #[serde(default)]
    pub process_id: u32,

    /// Category of the event.
    pub task_name: String,

    /// Sub-category of the event, possibly carrying an identifier suffix.
    pub event_type: String,

    /// Free-form event text.
    #[serde(default)]
    pub event_text: String,
}

impl TraceEvent {
    /// The event type with any identifier suffix removed.
    ///
    /// This is the form used for filter matching.
    pub fn base_event_type(&self) -> &str {
        strip_event_type_suffix(&self.event_type)
    }
}

/// Strip the identifier suffix from an event type, if present.
///
/// ```
/// use tracesieve_core::strip_event_type_suffix;
///
/// assert_eq!(strip_event_type_suffix("ReplicaOpen@7f3a"), "ReplicaOpen");
/// assert_eq!(strip_event_type_suffix("ReplicaOpen"), "ReplicaOpen");
/// ```
pub fn strip_event_type_suffix(event_type: &str) -> &str {
    match event_type.find(EVENT_TYPE_SUFFIX_SEPARATOR) {
        Some(pos) => &event_type[..pos],
        None => event_type,
    }
}

/// Totally ordered identity of an event within one source segment.
///
/// The differentiator is the 0-based position of the event within the batch of
/// events sharing its timestamp. It is assigned by the batcher, never by the
/// producer, and must be recomputed identically on every pass that re-reads
/// the same events.
///
/// Ordering compares `timestamp` first, then `differentiator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventIndex {
    /// Timestamp of the event.
    pub timestamp: DateTime<Utc>,

    /// Position of the event within its timestamp batch.
    pub differentiator: u32,
}

impl EventIndex {
    /// Sentinel that orders before every real event.
    pub const MIN: EventIndex = EventIndex {
        timestamp: DateTime::<Utc>::MIN_UTC,
        differentiator: 0,
    };

    /// Create a new index.
    pub fn new(timestamp: DateTime<Utc>, differentiator: u32) -> Self {
        Self {
            timestamp,
            differentiator,
        }
    }

    /// Whether this is the [`EventIndex::MIN`] sentinel.
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    /// Binary form of the timestamp (nanoseconds since the Unix epoch).
    pub fn timestamp_binary(&self) -> i128 {
        timestamp_to_binary(&self.timestamp)
    }

    /// Human-readable form of the timestamp.
    pub fn timestamp_human(&self) -> String {
        timestamp_to_human(&self.timestamp)
    }

    /// Rebuild an index from its persisted binary timestamp and differentiator.
    pub fn from_binary(timestamp_binary: i128, differentiator: u32) -> Result<Self> {
        Ok(Self::new(
            timestamp_from_binary(timestamp_binary)?,
            differentiator,
        ))
    }
}

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            write!(f, "(min)")
        } else {
            write!(f, "({}, {})", self.timestamp_human(), self.differentiator)
        }
    }
}

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Convert a timestamp to its binary form.
pub fn timestamp_to_binary(timestamp: &DateTime<Utc>) -> i128 {
    i128::from(timestamp.timestamp()) * NANOS_PER_SEC
        + i128::from(timestamp.timestamp_subsec_nanos())
}

/// Convert a binary timestamp back to a `DateTime`.
pub fn timestamp_from_binary(binary: i128) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(binary.div_euclid(NANOS_PER_SEC))
        .map_err(|_| Error::TimestampOutOfRange(binary))?;
    // rem_euclid keeps this in 0..NANOS_PER_SEC.
    let nanos = binary.rem_euclid(NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or(Error::TimestampOutOfRange(binary))
}

/// Human-readable form of a timestamp.
pub fn timestamp_to_human(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Build the identifier handed to sinks for an event.
///
/// Format: `<bookmark>_<sequence>`, where `sequence` is the position of the
/// event among all events submitted since the segment was opened at
/// `bookmark`. A pass that starts at the same bookmark re-reads the same events
/// in the same order, so the identifier is unique within a source and identical
/// every time the same event is processed.
pub fn stable_event_id(bookmark: &str, sequence: u64) -> String {
    format!("{bookmark}_{sequence}")
}

// ═══════════════════════════════════════════════════════════════════════════
// Buffered event line format
// ═══════════════════════════════════════════════════════════════════════════

// Positions of the comma-separated parts of an encoded event line.
const PART_UNIQUE_ID: usize = 0;
const PART_TIMESTAMP_BINARY: usize = 1;
const PART_LEVEL: usize = 3;
const PART_THREAD_ID: usize = 4;
const PART_PROCESS_ID: usize = 5;
const PART_TASK_NAME: usize = 6;
const PART_EVENT_TYPE: usize = 7;
const PART_EVENT_TEXT: usize = 8;

/// Number of comma-separated parts in an encoded event line.
pub const EVENT_LINE_PARTS: usize = 9;

/// Encode an event as one line (without the trailing newline).
///
/// Line breaks inside the event text are replaced by tabs so the record stays
/// on one line. The text is the last field and may contain commas.
pub fn encode_event_line(unique_id: &str, event: &TraceEvent) -> String {
    let line = format!(
        "{},{},{},{},{},{},{},{},{}",
        unique_id,
        timestamp_to_binary(&event.timestamp),
        timestamp_to_human(&event.timestamp),
        event.level,
        event.thread_id,
        event.process_id,
        event.task_name,
        event.event_type,
        event.event_text,
    );
    line.replace("\r\n", "\t").replace(['\n', '\r'], "\t")
}

/// Decode a line produced by [`encode_event_line`].
///
/// Returns the unique id and the event.
pub fn decode_event_line(line: &str) -> Result<(String, TraceEvent)> {
    let parts: Vec<&str> = line.splitn(EVENT_LINE_PARTS, ',').collect();
    if parts.len() != EVENT_LINE_PARTS {
        return Err(Error::MalformedLine {
            expected: EVENT_LINE_PARTS,
            found: parts.len(),
        });
    }

    let timestamp_binary: i128 =
        parts[PART_TIMESTAMP_BINARY]
            .parse()
            .map_err(|e| Error::InvalidField {
                field: "timestamp",
                reason: format!("{e}"),
            })?;
    let level: u8 = parts[PART_LEVEL]
        .parse()
        .map_err(|e| Error::InvalidField {
            field: "level",
            reason: format!("{e}"),
        })?;
    let thread_id: u32 = parts[PART_THREAD_ID]
        .parse()
        .map_err(|e| Error::InvalidField {
            field: "thread_id",
            reason: format!("{e}"),
        })?;
    let process_id: u32 =
        parts[PART_PROCESS_ID]
            .parse()
            .map_err(|e| Error::InvalidField {
                field: "process_id",
                reason: format!("{e}"),
            })?;

    // Part 2 is the human-readable timestamp, which is informational only.
    let event = TraceEvent {
        timestamp: timestamp_from_binary(timestamp_binary)?,
        level,
        thread_id,
        process_id,
        task_name: parts[PART_TASK_NAME].to_string(),
        event_type: parts[PART_EVENT_TYPE].to_string(),
        event_text: parts[PART_EVENT_TEXT].to_string(),
    };

    Ok((parts[PART_UNIQUE_ID].to_string(), event))
}
