//! Core types and shared utilities for the tracesieve ingestion pipeline.
//!
//! This crate provides:
//! - Decoded trace events and their `(timestamp, differentiator)` identity
//! - Binary and human timestamp encodings used by persisted watermarks
//! - The stable per-event identifier exposed to sinks
//! - The buffered event line format shared by file sinks and their readers
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Lowest (most severe) event level.
pub const LEVEL_SILENT: u8 = 0;

/// Highest (least severe) event level.
pub const LEVEL_NOISE: u8 = 5;

/// Version written on the first line of buffered event files.
///
/// Version 1 files carried microsecond timestamps.
pub const EVENT_FILE_FORMAT_VERSION: u32 = 2;

pub use error::{Error, Result};
pub use event::{
    EVENT_LINE_PARTS, EVENT_TYPE_SUFFIX_SEPARATOR, EventIndex, TraceEvent, decode_event_line,
    encode_event_line, stable_event_id, strip_event_type_suffix, timestamp_from_binary,
    timestamp_to_binary, timestamp_to_human,
};
