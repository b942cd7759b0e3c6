//! Sliding-window event buffer.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Row;

/// One event on a live stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream the event belongs to.
    pub stream: String,
    /// Event time in milliseconds.
    pub timestamp_ms: i64,
    /// Event payload.
    pub row: Row,
}

impl StreamEvent {
    /// Creates an event.
    pub fn new(stream: impl Into<String>, timestamp_ms: i64, row: Row) -> Self {
        Self {
            stream: stream.into(),
            timestamp_ms,
            row,
        }
    }
}

/// What happened to an inserted event.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Whether the event is now held by the buffer.
    pub accepted: bool,
    /// Events removed by this insert: expired ones first, then overflow.
    pub evicted: Vec<StreamEvent>,
    /// Events among `evicted` removed because capacity was exceeded.
    pub overflowed: u64,
}

/// Fixed-capacity, time-ordered buffer of one stream's recent events.
///
/// `now` is the greatest event time seen. The buffer only ever holds events
/// with timestamps in `[now - window, now]`: inserting evicts anything older,
/// and an event already older than that is rejected. Once capacity is reached
/// the oldest event is dropped; producers are never slowed down.
#[derive(Debug)]
pub struct StreamBuffer {
    stream: String,
    window_ms: i64,
    capacity: usize,
    events: VecDeque<StreamEvent>,
    now: Option<i64>,
    overflow_dropped: u64,
    stale_rejected: u64,
}

impl StreamBuffer {
    /// Creates an empty buffer.
    pub fn new(stream: impl Into<String>, window_ms: i64, capacity: usize) -> Self {
        Self {
            stream: stream.into(),
            window_ms: window_ms.max(0),
            capacity: capacity.max(1),
            events: VecDeque::new(),
            now: None,
            overflow_dropped: 0,
            stale_rejected: 0,
        }
    }

    /// Stream this buffer belongs to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Greatest event time seen.
    pub fn now(&self) -> Option<i64> {
        self.now
    }

    /// Window size in milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are held.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events dropped because the buffer was full.
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    /// Events rejected because they were already outside the window.
    pub fn stale_rejected(&self) -> u64 {
        self.stale_rejected
    }

    /// Held events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    /// Inserts an event, keeping time order and the window invariant.
    pub fn insert(&mut self, event: StreamEvent) -> InsertOutcome {
        let now = self.now.map_or(event.timestamp_ms, |n| n.max(event.timestamp_ms));
        self.now = Some(now);
        let horizon = now.saturating_sub(self.window_ms);

        let mut outcome = InsertOutcome::default();
        while self
            .events
            .front()
            .is_some_and(|front| front.timestamp_ms < horizon)
        {
            if let Some(expired) = self.events.pop_front() {
                outcome.evicted.push(expired);
            }
        }

        if event.timestamp_ms < horizon {
            self.stale_rejected += 1;
            return outcome;
        }

        // Out-of-order arrivals are placed after every event with an equal
        // or earlier timestamp.
        let at = self
            .events
            .iter()
            .rposition(|e| e.timestamp_ms <= event.timestamp_ms)
            .map_or(0, |i| i + 1);
        self.events.insert(at, event);
        let mut inserted_at = Some(at);
        outcome.accepted = true;

        while self.events.len() > self.capacity {
            let Some(oldest) = self.events.pop_front() else {
                break;
            };
            inserted_at = match inserted_at {
                // The new event itself was the oldest.
                Some(0) => {
                    outcome.accepted = false;
                    None
                }
                Some(i) => Some(i - 1),
                None => None,
            };
            outcome.overflowed += 1;
            outcome.evicted.push(oldest);
        }
        if outcome.overflowed > 0 {
            self.overflow_dropped += outcome.overflowed;
            debug!(
                stream = %self.stream,
                dropped = outcome.overflowed,
                capacity = self.capacity,
                "streaming.buffer.overflow"
            );
        }
        outcome
    }

    /// Drops every held event.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::row;
    use proptest::prelude::*;

    fn event(ts: i64) -> StreamEvent {
        StreamEvent::new("s", ts, row([("ts", ts)]))
    }

    #[test]
    fn old_events_are_evicted_on_insert() {
        let mut buf = StreamBuffer::new("s", 5_000, 100);
        for ts in (0..=12_000).step_by(1_000) {
            buf.insert(event(ts));
        }
        let held: Vec<i64> = buf.events().map(|e| e.timestamp_ms).collect();
        assert_eq!(held, vec![7_000, 8_000, 9_000, 10_000, 11_000, 12_000]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buf = StreamBuffer::new("s", 60_000, 3);
        for ts in 0..5 {
            buf.insert(event(ts));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.overflow_dropped(), 2);
        assert_eq!(buf.events().next().map(|e| e.timestamp_ms), Some(2));
    }

    #[test]
    fn stale_events_are_rejected() {
        let mut buf = StreamBuffer::new("s", 1_000, 10);
        buf.insert(event(5_000));
        let outcome = buf.insert(event(3_000));
        assert!(!outcome.accepted);
        assert_eq!(buf.stale_rejected(), 1);
        assert!(buf.insert(event(4_500)).accepted);
        let held: Vec<i64> = buf.events().map(|e| e.timestamp_ms).collect();
        assert_eq!(held, vec![4_500, 5_000]);
    }

    proptest! {
        #[test]
        fn buffer_only_holds_events_inside_the_window(
            stamps in proptest::collection::vec(0i64..100_000, 1..200),
            window in 1i64..20_000,
            capacity in 1usize..64,
        ) {
            let mut buf = StreamBuffer::new("s", window, capacity);
            for ts in stamps {
                buf.insert(event(ts));
                let now = buf.now().unwrap_or(ts);
                prop_assert!(buf.len() <= capacity);
                for e in buf.events() {
                    prop_assert!(e.timestamp_ms >= now - window && e.timestamp_ms <= now);
                }
                let ordered: Vec<i64> = buf.events().map(|e| e.timestamp_ms).collect();
                prop_assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
