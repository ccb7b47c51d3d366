//! Tracesieve ingestion pipeline components.
//!
//! This crate turns segment-at-a-time trace readers into idempotent,
//! resumable event delivery: every event reaches each sink at most once per
//! sink, in order, across restarts and repeated reads of the same input.
//!
//! # Modules
//!
//! - [`pipeline`] - The [`EventBatcher`] (batching, dedup, flush decisions)
//! - [`filter`] - Per-event inclusion rules and the filter registry
//! - [`resume`] - Durable per-source watermarks
//! - [`sink`] - The sink contract and CSV, cache and in-memory sinks
//! - [`source`] - The segment reader contract and a JSONL reader
//! - [`schedule`] - Recurring passes on cancellable timers
//! - [`retry`], [`compression`], [`config`] - Supporting pieces
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  SegmentSource  │  (JSONL files; one segment per file)
//! └────────┬────────┘
//!          │ segment_start / submit / segment_end
//!          ▼
//! ┌─────────────────┐     ┌───────────────────┐
//! │  EventBatcher   │────▶│ ResumptionTracker │  watermark per source
//! └────────┬────────┘     └───────────────────┘
//!          │ InclusionFilter
//!          ▼
//! ┌─────────────────┐
//! │    EventSink    │  (CSV artifacts, cache files, memory)
//! └─────────────────┘
//! ```
//!
//! A pass reads every segment once. The watermark only advances after the
//! sink has accepted a whole segment, so a failed pass is simply re-run.

pub mod compression;
pub mod config;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod resume;
pub mod retry;
pub mod schedule;
pub mod sink;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::{AgentConfig, ResumeKind, SinkKind};

pub use filter::{
    Decision, FilterAliases, FilterHandle, FilterRegistry, FilterRule, InclusionFilter,
};

pub use pipeline::{EventBatcher, FlushDecision, SegmentOutcome};

pub use resume::{ArtifactTracker, BookmarkTracker, ResumptionTracker};

pub use retry::{RetryPolicy, retry_io};

pub use schedule::{PassControl, Scheduler, ThreadScheduler, schedule_recurring};

pub use sink::{
    BufferedCacheSink, CacheConfig, CacheDelivery, CsvFileSink, EventSink, MemorySink,
    SealedArtifact, SinkConfig,
};

pub use source::{JsonlConfig, JsonlSegmentSource, PassStats, SegmentHandler, SegmentSource};
