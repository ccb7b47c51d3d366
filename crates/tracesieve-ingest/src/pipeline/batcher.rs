//! Same-timestamp batching with flush-or-discard at segment end.
//!
//! Events arrive in non-decreasing timestamp order. They are held in a pending
//! batch until an event with a later timestamp shows the batch is complete,
//! at which point the batch is flushed:
//!
//! ```text
//! for each event in arrival order:
//!     index = (timestamp, position in batch)
//!     index <= watermark      -> Duplicate, dropped
//!     filter excludes         -> Excluded (still moves the high-water mark)
//!     otherwise               -> sink.on_event
//! ```
//!
//! At segment end the trailing batch may still be growing. It is flushed when
//! the segment is closed, or when the next pass will resume from the same
//! bookmark and therefore re-read an identical batch. Otherwise it is
//! discarded and picked up by the next pass.

use crate::filter::{Decision, FilterHandle, InclusionFilter};
use crate::resume::ResumptionTracker;
use crate::sink::EventSink;
use crate::source::SegmentHandler;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tracesieve_core::{EventIndex, TraceEvent, stable_event_id};
use tracing::{debug, error, info};

/// Whether a flushed event is new to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The event is above the watermark.
    Accepted,
    /// A previous pass already handled the event.
    Duplicate,
}

/// What happens to the trailing batch at segment end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Process the batch now.
    Flush,
    /// Drop the batch unprocessed; the next pass re-reads it.
    Discard,
}

/// Decide whether an event with `index` is new given the highest index seen.
pub fn admit(index: EventIndex, high_water: EventIndex) -> Admission {
    if index > high_water {
        Admission::Accepted
    } else {
        Admission::Duplicate
    }
}

/// Decide the fate of the trailing batch at segment end.
///
/// A closed segment never gets another pass, so its batch is always flushed.
/// An active segment's batch is flushed only if the next pass resumes from
/// the bookmark this pass started at.
pub fn flush_decision(is_active: bool, current_bookmark: &str, next_bookmark: &str) -> FlushDecision {
    if !is_active || current_bookmark == next_bookmark {
        FlushDecision::Flush
    } else {
        FlushDecision::Discard
    }
}

/// Result of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    /// Source the segment belongs to.
    pub source_id: String,

    /// Events submitted by the reader.
    pub submitted: u64,

    /// Events handed to the sink.
    pub delivered: u64,

    /// Flushed events at or below the watermark.
    pub duplicates: u64,

    /// Flushed events rejected by the filter.
    pub excluded: u64,

    /// Events in a discarded trailing batch.
    pub discarded: u64,

    /// Decision taken for the trailing batch.
    pub trailing_batch: FlushDecision,

    /// Watermark after the segment.
    pub watermark: EventIndex,
}

struct PendingEvent {
    event: TraceEvent,
    sequence: u64,
}

/// Per-segment state. Owned by exactly one batcher for the length of a pass.
struct OpenSegment {
    source_id: String,
    bookmark: String,
    filter: Arc<InclusionFilter>,
    watermark: EventIndex,
    high_water: EventIndex,
    pending: Vec<PendingEvent>,
    pending_timestamp: DateTime<Utc>,
    next_sequence: u64,
    failure: Option<Error>,
    submitted: u64,
    delivered: u64,
    duplicates: u64,
    excluded: u64,
}

/// Groups events into same-timestamp batches and delivers them to a sink.
///
/// One batcher serves one sink. It is reused across the segments of a pass
/// but handles one segment at a time.
pub struct EventBatcher<S: EventSink> {
    sink: S,
    tracker: Arc<dyn ResumptionTracker>,
    filter: FilterHandle,
    segment: Option<OpenSegment>,
}

impl<S: EventSink> EventBatcher<S> {
    /// Create a batcher delivering to `sink`.
    pub fn new(sink: S, tracker: Arc<dyn ResumptionTracker>, filter: FilterHandle) -> Self {
        Self {
            sink,
            tracker,
            filter,
            segment: None,
        }
    }

    /// The sink events are delivered to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the batcher, returning the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Whether a segment is open.
    pub fn in_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Open a segment that starts reading at `bookmark`.
    ///
    /// Reads the watermark and snapshots the filter. On error no segment is
    /// opened and the reader must skip the segment for this pass.
    ///
    /// # Panics
    ///
    /// Panics if a segment is already open.
    pub fn segment_start(&mut self, source_id: &str, bookmark: &str) -> Result<()> {
        assert!(
            self.segment.is_none(),
            "segment_start for {source_id} while another segment is open"
        );

        let watermark = self.tracker.max_index_already(source_id).inspect_err(|e| {
            error!(
                "Cannot read watermark for {} at bookmark {}: {}",
                source_id, bookmark, e
            );
        })?;
        self.sink.on_segment_start(source_id).inspect_err(|e| {
            error!(
                "Sink {} failed to open segment {} at bookmark {}: {}",
                self.sink.name(),
                source_id,
                bookmark,
                e
            );
        })?;

        debug!(
            "Segment {} opened at bookmark {} (watermark {})",
            source_id, bookmark, watermark
        );

        self.segment = Some(OpenSegment {
            source_id: source_id.to_string(),
            bookmark: bookmark.to_string(),
            filter: self.filter.snapshot(),
            watermark,
            high_water: watermark,
            pending: Vec::new(),
            pending_timestamp: EventIndex::MIN.timestamp,
            next_sequence: 0,
            failure: None,
            submitted: 0,
            delivered: 0,
            duplicates: 0,
            excluded: 0,
        });
        Ok(())
    }

    /// Add an event to the segment.
    ///
    /// # Panics
    ///
    /// Panics if no segment is open or if the event is older than the pending
    /// batch; both mean the reader broke its ordering contract.
    pub fn submit(&mut self, event: TraceEvent) {
        let Some(segment) = self.segment.as_mut() else {
            panic!("submit called outside a segment");
        };

        assert!(
            event.timestamp >= segment.pending_timestamp,
            "event at {} submitted after {} in segment {}",
            event.timestamp,
            segment.pending_timestamp,
            segment.source_id
        );

        if event.timestamp > segment.pending_timestamp {
            flush(segment, &mut self.sink);
            segment.pending_timestamp = event.timestamp;
        }

        let sequence = segment.next_sequence;
        segment.next_sequence += 1;
        segment.submitted += 1;
        segment.pending.push(PendingEvent { event, sequence });
        counter!("batcher_events_submitted_total").increment(1);
    }

    /// Close the segment.
    ///
    /// The trailing batch is flushed or discarded per [`flush_decision`]. If
    /// the sink accepted everything the watermark is advanced to the highest
    /// index flushed in the segment. If the sink failed at any point the
    /// segment is aborted, the watermark stays put and the error is returned.
    ///
    /// # Panics
    ///
    /// Panics if no segment is open.
    pub fn segment_end(
        &mut self,
        is_active: bool,
        current_bookmark: &str,
        next_bookmark: &str,
    ) -> Result<SegmentOutcome> {
        let Some(mut segment) = self.segment.take() else {
            panic!("segment_end called outside a segment");
        };

        let decision = flush_decision(is_active, current_bookmark, next_bookmark);
        let mut discarded = 0;
        match decision {
            FlushDecision::Flush => flush(&mut segment, &mut self.sink),
            FlushDecision::Discard => {
                discarded = segment.pending.len() as u64;
                if discarded > 0 {
                    debug!(
                        "Discarding {} trailing events of active segment {} (bookmark {} -> {})",
                        discarded, segment.source_id, current_bookmark, next_bookmark
                    );
                    counter!("batcher_batches_discarded_total").increment(1);
                }
            }
        }
        segment.pending.clear();
        segment.pending_timestamp = EventIndex::MIN.timestamp;

        let source_id = segment.source_id.clone();
        if let Some(e) = segment.failure.take() {
            return Err(self.fail_segment(&source_id, current_bookmark, e));
        }

        if let Err(e) = self.sink.on_segment_end(&source_id, is_active) {
            return Err(self.fail_segment(&source_id, current_bookmark, e));
        }

        if segment.high_water > segment.watermark {
            self.tracker
                .advance(&source_id, segment.high_water)
                .inspect_err(|e| {
                    error!(
                        "Delivered segment {} at bookmark {} but could not advance watermark to {}: {}",
                        source_id, current_bookmark, segment.high_water, e
                    );
                })?;
        }

        let outcome = SegmentOutcome {
            source_id,
            submitted: segment.submitted,
            delivered: segment.delivered,
            duplicates: segment.duplicates,
            excluded: segment.excluded,
            discarded,
            trailing_batch: decision,
            watermark: segment.high_water,
        };

        info!(
            "Segment {} done: {} submitted, {} delivered, {} duplicate, {} excluded, {} deferred; watermark {}",
            outcome.source_id,
            outcome.submitted,
            outcome.delivered,
            outcome.duplicates,
            outcome.excluded,
            outcome.discarded,
            outcome.watermark
        );
        Ok(outcome)
    }

    fn fail_segment(&mut self, source_id: &str, bookmark: &str, e: Error) -> Error {
        error!(
            "Sink {} failed for segment {} at bookmark {}: {}; watermark not advanced",
            self.sink.name(),
            source_id,
            bookmark,
            e
        );
        self.sink.abort_segment(source_id);
        counter!("batcher_segments_failed_total").increment(1);
        e
    }
}

/// Flush the pending batch in arrival order.
///
/// Differentiators are positions within the batch. Every accepted event moves
/// the high-water mark, whether the filter includes it or not. After a sink
/// failure nothing more is delivered for the segment.
fn flush<S: EventSink>(segment: &mut OpenSegment, sink: &mut S) {
    for (position, pending) in segment.pending.drain(..).enumerate() {
        let index = EventIndex::new(pending.event.timestamp, position as u32);

        if admit(index, segment.high_water) == Admission::Duplicate {
            segment.duplicates += 1;
            counter!("batcher_events_duplicate_total").increment(1);
            continue;
        }
        segment.high_water = index;

        if segment.filter.decide(&pending.event) == Decision::Excluded {
            segment.excluded += 1;
            counter!("batcher_events_excluded_total").increment(1);
            continue;
        }

        if segment.failure.is_some() {
            continue;
        }

        let stable_id = stable_event_id(&segment.bookmark, pending.sequence);
        match sink.on_event(&pending.event, index, &stable_id) {
            Ok(()) => {
                segment.delivered += 1;
                counter!("batcher_events_delivered_total").increment(1);
            }
            Err(e) => segment.failure = Some(e),
        }
    }
}

impl<S: EventSink> SegmentHandler for EventBatcher<S> {
    fn segment_start(&mut self, source_id: &str, bookmark: &str) -> Result<()> {
        EventBatcher::segment_start(self, source_id, bookmark)
    }

    fn submit(&mut self, event: TraceEvent) {
        EventBatcher::submit(self, event)
    }

    fn segment_end(
        &mut self,
        is_active: bool,
        current_bookmark: &str,
        next_bookmark: &str,
    ) -> Result<SegmentOutcome> {
        EventBatcher::segment_end(self, is_active, current_bookmark, next_bookmark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterAliases;
    use crate::resume::BookmarkTracker;
    use crate::sink::{DeliveredEvent, MemorySink};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Tracker kept entirely in memory.
    #[derive(Default)]
    struct MemoryTracker {
        marks: Mutex<HashMap<String, EventIndex>>,
    }

    impl ResumptionTracker for MemoryTracker {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn max_index_already(&self, source_id: &str) -> Result<EventIndex> {
            Ok(self
                .marks
                .lock()
                .get(source_id)
                .copied()
                .unwrap_or(EventIndex::MIN))
        }

        fn advance(&self, source_id: &str, index: EventIndex) -> Result<()> {
            let mut marks = self.marks.lock();
            let entry = marks.entry(source_id.to_string()).or_insert(EventIndex::MIN);
            *entry = (*entry).max(index);
            Ok(())
        }
    }

    /// Sink that fails on the n-th event.
    struct FailingSink {
        fail_at: usize,
        seen: usize,
        aborted: bool,
    }

    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_segment_start(&mut self, _source_id: &str) -> Result<()> {
            Ok(())
        }

        fn on_event(&mut self, _event: &TraceEvent, _index: EventIndex, _id: &str) -> Result<()> {
            self.seen += 1;
            if self.seen == self.fail_at {
                return Err(Error::Sink {
                    sink: "failing".to_string(),
                    reason: "disk full".to_string(),
                });
            }
            Ok(())
        }

        fn on_segment_end(&mut self, _source_id: &str, _is_active: bool) -> Result<()> {
            Ok(())
        }

        fn abort_segment(&mut self, _source_id: &str) {
            self.aborted = true;
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(secs: i64, task: &str, level: u8) -> TraceEvent {
        TraceEvent {
            timestamp: ts(secs),
            level,
            thread_id: 1,
            process_id: 1,
            task_name: task.to_string(),
            event_type: "Op".to_string(),
            event_text: format!("{task}@{secs}"),
        }
    }

    fn batcher(tracker: Arc<dyn ResumptionTracker>) -> EventBatcher<MemorySink> {
        EventBatcher::new(MemorySink::new("memory"), tracker, FilterHandle::default())
    }

    fn run_segment<S: EventSink>(
        batcher: &mut EventBatcher<S>,
        events: &[TraceEvent],
        is_active: bool,
        current: &str,
        next: &str,
    ) -> Result<SegmentOutcome> {
        batcher.segment_start("src", current)?;
        for e in events {
            batcher.submit(e.clone());
        }
        batcher.segment_end(is_active, current, next)
    }

    fn indexes(delivered: &[DeliveredEvent]) -> Vec<(i64, u32)> {
        delivered
            .iter()
            .map(|d| (d.index.timestamp.timestamp(), d.index.differentiator))
            .collect()
    }

    #[test]
    fn test_flush_decision() {
        assert_eq!(flush_decision(false, "B1", "B2"), FlushDecision::Flush);
        assert_eq!(flush_decision(true, "B1", "B1"), FlushDecision::Flush);
        assert_eq!(flush_decision(true, "B1", "B2"), FlushDecision::Discard);
    }

    #[test]
    fn test_admit() {
        let low = EventIndex::new(ts(10), 1);
        let high = EventIndex::new(ts(10), 2);
        assert_eq!(admit(high, low), Admission::Accepted);
        assert_eq!(admit(low, high), Admission::Duplicate);
        assert_eq!(admit(low, low), Admission::Duplicate);
        assert_eq!(admit(low, EventIndex::MIN), Admission::Accepted);
    }

    #[test]
    fn test_active_segment_same_bookmark_end_to_end() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker.clone());

        let events = [event(1, "A", 1), event(1, "B", 1), event(2, "C", 1)];
        let outcome = run_segment(&mut b, &events, true, "B1", "B1").unwrap();

        let delivered = b.sink().delivered();
        assert_eq!(indexes(&delivered), vec![(1, 0), (1, 1), (2, 0)]);
        assert_eq!(outcome.delivered, 3);
        assert_eq!(outcome.trailing_batch, FlushDecision::Flush);
        assert_eq!(outcome.watermark, EventIndex::new(ts(2), 0));
        assert_eq!(
            tracker.max_index_already("src").unwrap(),
            EventIndex::new(ts(2), 0)
        );
        assert_eq!(delivered[2].stable_id, "B1_2");
    }

    #[test]
    fn test_reread_is_idempotent() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker);

        let events = [
            event(1, "A", 1),
            event(1, "B", 1),
            event(2, "C", 1),
            event(3, "D", 1),
            event(3, "E", 1),
        ];
        run_segment(&mut b, &events, false, "B1", "B9").unwrap();
        let second = run_segment(&mut b, &events, false, "B1", "B9").unwrap();

        let delivered = b.sink().delivered();
        assert_eq!(delivered.len(), 5);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.duplicates, 5);

        let mut seen: Vec<_> = indexes(&delivered);
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_active_segment_discards_trailing_batch_until_bookmark_matches() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker);

        // Pass 1 started at B1; the next pass will start at the trailing batch (B2).
        let pass1 = [event(1, "A", 1), event(2, "B", 1), event(2, "C", 1)];
        let outcome = run_segment(&mut b, &pass1, true, "B1", "B2").unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.discarded, 2);
        assert_eq!(outcome.trailing_batch, FlushDecision::Discard);
        assert_eq!(indexes(&b.sink().delivered()), vec![(1, 0)]);

        // Pass 2 re-reads from B2, where the batch has grown by one event.
        let pass2 = [event(2, "B", 1), event(2, "C", 1), event(2, "D", 1)];
        let outcome = run_segment(&mut b, &pass2, true, "B2", "B2").unwrap();
        assert_eq!(outcome.delivered, 3);
        assert_eq!(
            indexes(&b.sink().delivered()),
            vec![(1, 0), (2, 0), (2, 1), (2, 2)]
        );
    }

    #[test]
    fn test_same_bookmark_flush_then_growth() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker);

        run_segment(&mut b, &[event(5, "A", 1), event(5, "B", 1)], true, "B1", "B1").unwrap();
        let outcome = run_segment(
            &mut b,
            &[event(5, "A", 1), event(5, "B", 1), event(5, "C", 1)],
            true,
            "B1",
            "B1",
        )
        .unwrap();

        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.delivered, 1);
        let delivered = b.sink().delivered();
        assert_eq!(delivered.last().unwrap().event.task_name, "C");
        assert_eq!(delivered.last().unwrap().stable_id, "B1_2");
    }

    #[test]
    fn test_batch_flushed_together_before_next_batch() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker);

        b.segment_start("src", "B1").unwrap();
        b.submit(event(1, "A", 1));
        b.submit(event(1, "B", 1));
        assert!(b.sink_mut().delivered().is_empty());

        b.submit(event(2, "C", 1));
        b.segment_end(true, "B1", "B2").unwrap();

        let delivered = b.sink().delivered();
        let tasks: Vec<&str> = delivered.iter().map(|d| d.event.task_name.as_str()).collect();
        assert_eq!(tasks, vec!["A", "B"]);
        assert_eq!(indexes(&delivered), vec![(1, 0), (1, 1)]);
    }

    #[test]
    fn test_excluded_events_still_move_watermark() {
        let tracker = Arc::new(MemoryTracker::default());
        let filter = FilterHandle::new(
            InclusionFilter::parse("*.*:2", &FilterAliases::default()).unwrap(),
        );
        let mut b = EventBatcher::new(MemorySink::new("memory"), tracker.clone(), filter);

        let events = [event(1, "A", 1), event(1, "B", 5), event(2, "C", 5)];
        let outcome = run_segment(&mut b, &events, false, "B1", "B2").unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.excluded, 2);
        assert_eq!(
            tracker.max_index_already("src").unwrap(),
            EventIndex::new(ts(2), 0)
        );

        // Re-reading finds nothing new, included or not.
        let outcome = run_segment(&mut b, &events, false, "B1", "B2").unwrap();
        assert_eq!(outcome.duplicates, 3);
        assert_eq!(outcome.excluded, 0);
    }

    #[test]
    fn test_stable_ids_use_running_sequence() {
        let tracker = Arc::new(MemoryTracker::default());
        let mut b = batcher(tracker);

        let events = [event(1, "A", 1), event(2, "B", 1), event(2, "C", 1)];
        run_segment(&mut b, &events, false, "file.jsonl:0", "file.jsonl:99").unwrap();

        let ids: Vec<String> = b.sink().delivered().into_iter().map(|d| d.stable_id).collect();
        assert_eq!(ids, vec!["file.jsonl:0_0", "file.jsonl:0_1", "file.jsonl:0_2"]);
    }

    #[test]
    fn test_sink_failure_skips_advance() {
        let tracker = Arc::new(MemoryTracker::default());
        let sink = FailingSink {
            fail_at: 2,
            seen: 0,
            aborted: false,
        };
        let mut b = EventBatcher::new(sink, tracker.clone(), FilterHandle::default());

        let events = [event(1, "A", 1), event(2, "B", 1), event(3, "C", 1)];
        let err = run_segment(&mut b, &events, false, "B1", "B2").unwrap_err();

        assert!(matches!(err, Error::Sink { .. }));
        assert!(b.sink().aborted);
        assert_eq!(b.sink().seen, 2);
        assert!(!b.in_segment());
        assert_eq!(tracker.max_index_already("src").unwrap(), EventIndex::MIN);
    }

    #[test]
    fn test_watermark_survives_restart_with_bookmark_file() {
        let tmp = TempDir::new().unwrap();
        let events = [event(1, "A", 1), event(1, "B", 1), event(2, "C", 1)];

        {
            let tracker = Arc::new(BookmarkTracker::open(tmp.path()).unwrap());
            let mut b = batcher(tracker);
            run_segment(&mut b, &events[..2], true, "B1", "B1").unwrap();
            assert_eq!(b.sink().delivered().len(), 2);
        }

        let tracker = Arc::new(BookmarkTracker::open(tmp.path()).unwrap());
        let mut b = batcher(tracker);
        let outcome = run_segment(&mut b, &events, true, "B1", "B1").unwrap();

        assert_eq!(outcome.duplicates, 2);
        assert_eq!(indexes(&b.sink().delivered()), vec![(2, 0)]);
    }

    #[test]
    fn test_filter_replaced_between_segments() {
        let tracker = Arc::new(MemoryTracker::default());
        let handle = FilterHandle::default();
        let mut b = EventBatcher::new(MemorySink::new("memory"), tracker, handle.clone());

        b.segment_start("src", "B1").unwrap();
        b.submit(event(1, "A", 5));
        // Replacing mid-segment does not affect the open segment.
        handle.replace(InclusionFilter::parse("*.*:0", &FilterAliases::default()).unwrap());
        b.submit(event(2, "B", 5));
        b.segment_end(false, "B1", "B2").unwrap();
        assert_eq!(b.sink().delivered().len(), 2);

        run_segment(&mut b, &[event(3, "C", 5)], false, "B2", "B3").unwrap();
        assert_eq!(b.sink().delivered().len(), 2);
    }

    #[test]
    #[should_panic(expected = "submitted after")]
    fn test_out_of_order_timestamp_panics() {
        let mut b = batcher(Arc::new(MemoryTracker::default()));
        b.segment_start("src", "B1").unwrap();
        b.submit(event(2, "A", 1));
        b.submit(event(1, "B", 1));
    }

    #[test]
    #[should_panic(expected = "outside a segment")]
    fn test_submit_without_segment_panics() {
        let mut b = batcher(Arc::new(MemoryTracker::default()));
        b.submit(event(1, "A", 1));
    }
}
