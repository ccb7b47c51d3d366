//! Event sinks.
//!
//! A sink receives the filtered, deduplicated event stream of one source
//! segment through three callbacks:
//!
//! ```text
//! on_segment_start(source) → on_event(...)* → on_segment_end(source, is_active)
//! ```
//!
//! The batcher advances the resumption watermark only after
//! [`EventSink::on_segment_end`] returns `Ok`, so a sink must have made the
//! segment's events durable by then. When delivery fails part way the batcher
//! calls [`EventSink::abort_segment`] instead, and the segment is offered again
//! on a later pass.
//!
//! # Available Sinks
//!
//! - [`CsvFileSink`] - One (optionally gzipped) artifact per segment, named
//!   after the index of its last event
//! - [`MemorySink`] - Collects events in memory and optionally forwards them
//!   over a channel
//! - [`BufferedCacheSink`] - Versioned cache files drained later by
//!   [`CacheDelivery`]

mod cache;
mod csv;
mod memory;

pub use cache::{
    BufferedCacheSink, CACHE_FILE_PREFIX, CacheConfig, CacheDelivery, ConsumerControl,
    DeliveryStats,
};
pub use csv::{CsvFileSink, SealedArtifact, SinkConfig};
pub use memory::{DeliveredEvent, MemorySink};

use crate::Result;
use tracesieve_core::{EventIndex, TraceEvent};

/// Destination for delivered events.
pub trait EventSink: Send {
    /// Human-readable name for this sink (used in logs and metrics).
    fn name(&self) -> &str;

    /// A segment of `source_id` is about to be delivered.
    fn on_segment_start(&mut self, source_id: &str) -> Result<()>;

    /// Deliver one event.
    ///
    /// `stable_id` is unique within the source and identical every time the
    /// same event is delivered.
    fn on_event(&mut self, event: &TraceEvent, index: EventIndex, stable_id: &str) -> Result<()>;

    /// The segment is complete. Events delivered since
    /// [`on_segment_start`](Self::on_segment_start) must be durable when this
    /// returns `Ok`.
    fn on_segment_end(&mut self, source_id: &str, is_active: bool) -> Result<()>;

    /// Delivery of the current segment failed; discard what was received.
    fn abort_segment(&mut self, _source_id: &str) {}
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_segment_start(&mut self, source_id: &str) -> Result<()> {
        (**self).on_segment_start(source_id)
    }

    fn on_event(&mut self, event: &TraceEvent, index: EventIndex, stable_id: &str) -> Result<()> {
        (**self).on_event(event, index, stable_id)
    }

    fn on_segment_end(&mut self, source_id: &str, is_active: bool) -> Result<()> {
        (**self).on_segment_end(source_id, is_active)
    }

    fn abort_segment(&mut self, source_id: &str) {
        (**self).abort_segment(source_id)
    }
}
