//! In-memory sink.
//!
//! Events are buffered per segment and published when the segment ends, so
//! consumers never observe events of a segment that was later aborted.

use super::EventSink;
use crate::Result;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use tracesieve_core::{EventIndex, TraceEvent};
use tracing::{debug, warn};

/// An event as received by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEvent {
    /// Source the event came from.
    pub source_id: String,

    /// Identifier assigned by the batcher.
    pub stable_id: String,

    /// Index of the event within its segment.
    pub index: EventIndex,

    /// The event itself.
    pub event: TraceEvent,
}

/// Sink that keeps delivered events in memory.
pub struct MemorySink {
    name: String,
    pending: Vec<DeliveredEvent>,
    source_id: Option<String>,
    delivered: Arc<Mutex<Vec<DeliveredEvent>>>,
    sender: Option<Sender<DeliveredEvent>>,
}

impl MemorySink {
    /// Create a sink that only records events.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending: Vec::new(),
            source_id: None,
            delivered: Arc::new(Mutex::new(Vec::new())),
            sender: None,
        }
    }

    /// Create a sink that also forwards published events over `sender`.
    pub fn with_sender(name: &str, sender: Sender<DeliveredEvent>) -> Self {
        Self {
            sender: Some(sender),
            ..Self::new(name)
        }
    }

    /// Shared view of the published events.
    pub fn delivered_handle(&self) -> Arc<Mutex<Vec<DeliveredEvent>>> {
        Arc::clone(&self.delivered)
    }

    /// Snapshot of the published events.
    pub fn delivered(&self) -> Vec<DeliveredEvent> {
        self.delivered.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_segment_start(&mut self, source_id: &str) -> Result<()> {
        self.pending.clear();
        self.source_id = Some(source_id.to_string());
        Ok(())
    }

    fn on_event(&mut self, event: &TraceEvent, index: EventIndex, stable_id: &str) -> Result<()> {
        self.pending.push(DeliveredEvent {
            source_id: self.source_id.clone().unwrap_or_default(),
            stable_id: stable_id.to_string(),
            index,
            event: event.clone(),
        });
        Ok(())
    }

    fn on_segment_end(&mut self, source_id: &str, _is_active: bool) -> Result<()> {
        let events = std::mem::take(&mut self.pending);
        debug!("Publishing {} events for {}", events.len(), source_id);

        if let Some(sender) = &self.sender {
            for event in &events {
                if let Err(e) = sender.send(event.clone()) {
                    warn!("Failed to forward event {}: {}", event.stable_id, e);
                    break;
                }
            }
        }

        self.delivered.lock().extend(events);
        self.source_id = None;
        Ok(())
    }

    fn abort_segment(&mut self, source_id: &str) {
        debug!(
            "Dropping {} unpublished events for {}",
            self.pending.len(),
            source_id
        );
        self.pending.clear();
        self.source_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn test_event(secs: i64) -> TraceEvent {
        TraceEvent {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            level: 1,
            thread_id: 0,
            process_id: 0,
            task_name: "Lease".to_string(),
            event_type: "Renew".to_string(),
            event_text: String::new(),
        }
    }

    #[test]
    fn test_publishes_on_segment_end() {
        let mut sink = MemorySink::new("memory");
        let handle = sink.delivered_handle();
        let e = test_event(1);

        sink.on_segment_start("s").unwrap();
        sink.on_event(&e, EventIndex::new(e.timestamp, 0), "b_0").unwrap();
        assert!(handle.lock().is_empty());

        sink.on_segment_end("s", false).unwrap();
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].source_id, "s");
        assert_eq!(delivered[0].stable_id, "b_0");
    }

    #[test]
    fn test_abort_drops_pending() {
        let mut sink = MemorySink::new("memory");
        let e = test_event(1);

        sink.on_segment_start("s").unwrap();
        sink.on_event(&e, EventIndex::new(e.timestamp, 0), "b_0").unwrap();
        sink.abort_segment("s");
        sink.on_segment_start("s").unwrap();
        sink.on_segment_end("s", false).unwrap();

        assert!(sink.delivered().is_empty());
    }

    #[test]
    fn test_forwards_over_channel() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut sink = MemorySink::with_sender("queue", sender);
        let e = test_event(2);

        sink.on_segment_start("s").unwrap();
        sink.on_event(&e, EventIndex::new(e.timestamp, 3), "b_3").unwrap();
        sink.on_segment_end("s", true).unwrap();

        let received = receiver.try_recv().unwrap();
        assert_eq!(received.index.differentiator, 3);
        assert_eq!(received.event, e);
    }
}
