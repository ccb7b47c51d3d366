//! Segment readers.
//!
//! A reader walks the segments of a source and reports each one to a
//! [`SegmentHandler`]:
//!
//! ```text
//! segment_start(source, bookmark) → submit(event)* → segment_end(is_active, current, next)
//! ```
//!
//! Events within a segment must be submitted in non-decreasing timestamp
//! order. `current` is the bookmark reading started at; `next` is where the
//! following pass will resume.
//!
//! # Available Sources
//!
//! - [`JsonlSegmentSource`] - A directory of JSONL files, one segment per file

mod jsonl;

pub use jsonl::{JsonlConfig, JsonlSegmentSource};

use crate::Result;
use crate::pipeline::SegmentOutcome;
use tracesieve_core::TraceEvent;

/// Receiver of the reader callbacks. Implemented by
/// [`EventBatcher`](crate::pipeline::EventBatcher).
pub trait SegmentHandler {
    /// A segment is opened at `bookmark`. On error the reader skips it.
    fn segment_start(&mut self, source_id: &str, bookmark: &str) -> Result<()>;

    /// One event of the open segment.
    fn submit(&mut self, event: TraceEvent);

    /// The open segment is finished for this pass.
    fn segment_end(
        &mut self,
        is_active: bool,
        current_bookmark: &str,
        next_bookmark: &str,
    ) -> Result<SegmentOutcome>;
}

/// A source of trace segments.
pub trait SegmentSource {
    /// Human-readable name for this source (used in logs and metrics).
    fn name(&self) -> &'static str;

    /// Read every segment once, reporting to `handler`.
    ///
    /// Segments that fail are logged and counted; they are retried on the next
    /// pass from the same bookmark.
    fn read_pass(&mut self, handler: &mut dyn SegmentHandler) -> Result<PassStats>;
}

/// Statistics from one read pass.
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    /// Segments opened.
    pub segments_read: usize,

    /// Segments whose start or end failed.
    pub segments_failed: usize,

    /// Events submitted.
    pub events_submitted: usize,

    /// Lines that could not be parsed.
    pub parse_errors: usize,

    /// Bytes read across all segments.
    pub bytes_read: u64,

    /// The pass ended early because of the stopping flag.
    pub stopped: bool,
}
