//! Core pipeline components for event ingestion.
//!
//! The [`EventBatcher`] sits between a segment reader and a sink:
//!
//! ```text
//! [SegmentSource] → [EventBatcher] → [EventSink]
//!                     ↓        ↑
//!           InclusionFilter  ResumptionTracker
//! ```
//!
//! Delivery is idempotent without any cross-pass transaction: events are
//! identified by their `(timestamp, position in batch)` index, which a re-read
//! recomputes identically, and the tracker's watermark suppresses everything
//! already delivered.

mod batcher;

pub use batcher::{Admission, EventBatcher, FlushDecision, SegmentOutcome, admit, flush_decision};
