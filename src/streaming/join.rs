//! Windowed equi-join of two live streams.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ops::join_rows;
use crate::streaming::buffer::{StreamBuffer, StreamEvent};
use crate::types::{Row, Value};

/// One join match delivered to the registered handler.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamMatch {
    /// Left event time.
    pub left_ts: i64,
    /// Right event time.
    pub right_ts: i64,
    /// Combined row, left columns first.
    pub row: Row,
}

/// Callback receiving stream join matches.
pub type MatchHandler = Arc<dyn Fn(&StreamMatch) + Send + Sync>;

/// Input side of a stream join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinSide {
    /// Left input.
    Left,
    /// Right input.
    Right,
}

struct SideState {
    key: String,
    buffer: StreamBuffer,
    index: FxHashMap<Value, VecDeque<(i64, Row)>>,
}

impl SideState {
    fn new(stream: &str, key: String, window_ms: i64, capacity: usize) -> Self {
        Self {
            key,
            buffer: StreamBuffer::new(stream, window_ms, capacity),
            index: FxHashMap::default(),
        }
    }

    fn forget(&mut self, evicted: &[StreamEvent]) {
        for event in evicted {
            let Some(key) = event.row.get(&self.key) else {
                continue;
            };
            if let Some(bucket) = self.index.get_mut(key) {
                if let Some(pos) = bucket
                    .iter()
                    .position(|(ts, row)| *ts == event.timestamp_ms && *row == event.row)
                {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    self.index.remove(key);
                }
            }
        }
    }
}

/// Bounded hash join over the current windows of two streams.
///
/// Each side keeps its recent events in a [`StreamBuffer`] plus a hash index
/// on the join key. An arriving event probes the other side's index; a match
/// requires equal non-null keys and timestamps at most one window apart.
pub struct StreamJoin {
    window_ms: i64,
    left: SideState,
    right: SideState,
}

/// Outcome of feeding one event into the join.
#[derive(Debug, Default)]
pub struct JoinStep {
    /// Matches produced by the event.
    pub matches: Vec<StreamMatch>,
    /// Events dropped from the side's buffer because it was full.
    pub overflowed: u64,
}

impl StreamJoin {
    /// Creates a join between two streams.
    pub fn new(
        left_stream: &str,
        left_key: impl Into<String>,
        right_stream: &str,
        right_key: impl Into<String>,
        window_ms: i64,
        capacity: usize,
    ) -> Self {
        Self {
            window_ms,
            left: SideState::new(left_stream, left_key.into(), window_ms, capacity),
            right: SideState::new(right_stream, right_key.into(), window_ms, capacity),
        }
    }

    /// Events currently buffered on `side`.
    pub fn buffered(&self, side: JoinSide) -> usize {
        match side {
            JoinSide::Left => self.left.buffer.len(),
            JoinSide::Right => self.right.buffer.len(),
        }
    }

    /// Adds an event to `side` and probes the other side.
    pub fn on_event(&mut self, side: JoinSide, event: StreamEvent) -> JoinStep {
        let (own, other) = match side {
            JoinSide::Left => (&mut self.left, &self.right),
            JoinSide::Right => (&mut self.right, &self.left),
        };
        let key = event.row.get(&own.key).filter(|k| !k.is_null()).cloned();
        let ts = event.timestamp_ms;
        let row = event.row.clone();

        let outcome = own.buffer.insert(event);
        own.forget(&outcome.evicted);
        let mut step = JoinStep {
            matches: Vec::new(),
            overflowed: outcome.overflowed,
        };
        let Some(key) = key.filter(|_| outcome.accepted) else {
            return step;
        };
        own.index
            .entry(key.clone())
            .or_default()
            .push_back((ts, row.clone()));

        if let Some(bucket) = other.index.get(&key) {
            for (other_ts, other_row) in bucket {
                if (ts - other_ts).abs() > self.window_ms {
                    continue;
                }
                let m = match side {
                    JoinSide::Left => StreamMatch {
                        left_ts: ts,
                        right_ts: *other_ts,
                        row: join_rows(&row, other_row),
                    },
                    JoinSide::Right => StreamMatch {
                        left_ts: *other_ts,
                        right_ts: ts,
                        row: join_rows(other_row, &row),
                    },
                };
                step.matches.push(m);
            }
        }
        step
    }

    /// Drops both sides' buffered events.
    pub fn clear(&mut self) {
        for side in [&mut self.left, &mut self.right] {
            side.buffer.clear();
            side.index.clear();
        }
    }
}
