//! Event-time windowed aggregation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fault::{OperatorSnapshot, SnapshotBody};
use crate::ops::{GroupSnapshot, GroupTable};
use crate::plan::AggregateExpr;
use crate::types::{ExecError, OperatorId, Result, Row, Value};

/// Column added to every emitted row with the window's inclusive start.
pub const WINDOW_START: &str = "window_start";
/// Column added to every emitted row with the window's exclusive end.
pub const WINDOW_END: &str = "window_end";

/// Checkpointed state of one open window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Window start in milliseconds.
    pub start: i64,
    /// Per-group partial aggregates.
    pub groups: Vec<GroupSnapshot>,
}

/// Aggregates emitted when a window closes.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowResult {
    /// Inclusive start in milliseconds.
    pub start: i64,
    /// Exclusive end in milliseconds.
    pub end: i64,
    /// One row per group, with window bounds attached.
    pub rows: Vec<Row>,
}

/// Keeps one aggregate state per open (window, group key) pair.
///
/// Windows are aligned to multiples of the slide; with slide equal to the
/// window size they tumble, with a smaller slide they overlap. A window
/// `[start, start + size)` closes once the watermark (greatest event time
/// seen) reaches its end. Events whose every window has closed are dropped.
#[derive(Debug)]
pub struct WindowedAggregator {
    id: OperatorId,
    size_ms: i64,
    slide_ms: i64,
    template: GroupTable,
    windows: BTreeMap<i64, GroupTable>,
    watermark: Option<i64>,
    late_dropped: u64,
}

impl WindowedAggregator {
    /// Creates an aggregator. A zero or oversized slide means tumbling.
    pub fn new(
        id: OperatorId,
        size_ms: i64,
        slide_ms: i64,
        group_by: Vec<String>,
        aggregates: Vec<AggregateExpr>,
    ) -> Result<Self> {
        if size_ms <= 0 {
            return Err(ExecError::config(format!(
                "window size for operator {id} must be positive"
            )));
        }
        let slide_ms = if slide_ms <= 0 || slide_ms > size_ms {
            size_ms
        } else {
            slide_ms
        };
        Ok(Self {
            id,
            size_ms,
            slide_ms,
            template: GroupTable::new(group_by, aggregates),
            windows: BTreeMap::new(),
            watermark: None,
            late_dropped: 0,
        })
    }

    /// Operator this aggregator belongs to.
    pub fn operator_id(&self) -> &OperatorId {
        &self.id
    }

    /// Greatest event time seen.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Windows currently open.
    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Events dropped because all their windows had closed.
    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Folds one event in, returning windows closed by the watermark advance.
    /// The returned flag is false when the event was dropped as late.
    pub fn on_event(&mut self, timestamp_ms: i64, row: &Row) -> (Vec<WindowResult>, bool) {
        let closed = self.advance(timestamp_ms);
        let watermark = self.watermark.unwrap_or(timestamp_ms);

        let mut assigned = false;
        for start in self.window_starts(timestamp_ms) {
            if start + self.size_ms <= watermark {
                continue;
            }
            let template = &self.template;
            self.windows
                .entry(start)
                .or_insert_with(|| template.empty_like())
                .accumulate(row);
            assigned = true;
        }
        if !assigned {
            self.late_dropped += 1;
            debug!(
                operator = %self.id,
                timestamp_ms,
                watermark,
                "streaming.window.late_event_dropped"
            );
        }
        (closed, assigned)
    }

    /// Advances event time without contributing a row, e.g. for an event a
    /// filter rejected.
    pub fn advance(&mut self, timestamp_ms: i64) -> Vec<WindowResult> {
        let watermark = self
            .watermark
            .map_or(timestamp_ms, |w| w.max(timestamp_ms));
        self.watermark = Some(watermark);
        self.close_until(watermark)
    }

    /// Emits every open window, complete or not.
    pub fn flush(&mut self) -> Vec<WindowResult> {
        let windows = std::mem::take(&mut self.windows);
        windows
            .into_iter()
            .map(|(start, table)| self.emit(start, table))
            .collect()
    }

    /// Captures open windows for a checkpoint.
    pub fn snapshot(&self) -> OperatorSnapshot {
        OperatorSnapshot::new(SnapshotBody::Window {
            watermark: self.watermark,
            windows: self
                .windows
                .iter()
                .map(|(start, table)| WindowSnapshot {
                    start: *start,
                    groups: table.snapshot(),
                })
                .collect(),
            late_dropped: self.late_dropped,
        })
    }

    /// Replaces state with a checkpoint.
    pub fn restore(&mut self, snapshot: OperatorSnapshot) -> Result<()> {
        let SnapshotBody::Window {
            watermark,
            windows,
            late_dropped,
        } = snapshot.body
        else {
            return Err(ExecError::checkpoint(&self.id, "expected a window snapshot"));
        };
        self.watermark = watermark;
        self.late_dropped = late_dropped;
        self.windows = windows
            .into_iter()
            .map(|w| {
                let mut table = self.template.empty_like();
                table.restore(w.groups);
                (w.start, table)
            })
            .collect();
        Ok(())
    }

    fn window_starts(&self, timestamp_ms: i64) -> Vec<i64> {
        let last = timestamp_ms.div_euclid(self.slide_ms) * self.slide_ms;
        let mut starts = Vec::new();
        let mut start = last;
        while start + self.size_ms > timestamp_ms {
            starts.push(start);
            start -= self.slide_ms;
        }
        starts.reverse();
        starts
    }

    fn close_until(&mut self, watermark: i64) -> Vec<WindowResult> {
        let mut closed = Vec::new();
        while let Some((&start, _)) = self.windows.first_key_value() {
            if start + self.size_ms > watermark {
                break;
            }
            if let Some(table) = self.windows.remove(&start) {
                closed.push(self.emit(start, table));
            }
        }
        closed
    }

    fn emit(&self, start: i64, table: GroupTable) -> WindowResult {
        let end = start + self.size_ms;
        let rows = table
            .into_rows()
            .into_iter()
            .map(|mut row| {
                row.insert(WINDOW_START.to_owned(), Value::Int(start));
                row.insert(WINDOW_END.to_owned(), Value::Int(end));
                row
            })
            .collect();
        debug!(operator = %self.id, start, end, "streaming.window.closed");
        WindowResult { start, end, rows }
    }
}
