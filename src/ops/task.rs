//! Resumable operator tasks run by the fault-tolerant shell.

use std::sync::mpsc::SyncSender;

use crate::fault::{OperatorSnapshot, Resumable, SnapshotBody, StepOutcome};
use crate::ops::aggregate::GroupTable;
use crate::ops::input::{RowInput, RowTransform};
use crate::types::{ExecError, OperatorId, Result, Row};

/// Bounded channel a task delivers committed output batches into.
pub type RowSink = SyncSender<Vec<Row>>;

/// Streams an input through a row transform.
///
/// Without a sink, output accumulates and is returned by `finish`; snapshots
/// carry it. With a sink, output is held back until the checkpoint covering
/// it commits and only then sent, so a retry never delivers a row twice:
/// batches that end at or before the last delivered position are replayed
/// for state but their output is discarded.
pub struct RowsTask {
    id: OperatorId,
    input: RowInput,
    transform: RowTransform,
    batch: u64,
    position: u64,
    pending: Vec<Row>,
    sink: Option<RowSink>,
    delivered_upto: u64,
}

impl RowsTask {
    /// Creates a task that returns its output from `finish`.
    pub fn new(id: OperatorId, input: RowInput, transform: RowTransform, batch: usize) -> Self {
        Self {
            id,
            input,
            transform,
            batch: batch.max(1) as u64,
            position: 0,
            pending: Vec::new(),
            sink: None,
            delivered_upto: 0,
        }
    }

    /// Delivers output through `sink` instead of returning it.
    pub fn with_sink(mut self, sink: RowSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn flush(&mut self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        if !self.pending.is_empty() {
            let rows = std::mem::take(&mut self.pending);
            // A closed receiver means the consumer went away.
            sink.send(rows).map_err(|_| ExecError::Cancelled)?;
        }
        self.delivered_upto = self.delivered_upto.max(self.position);
        Ok(())
    }
}

impl Resumable for RowsTask {
    type Output = Vec<Row>;

    fn operator_id(&self) -> &OperatorId {
        &self.id
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn counts_toward_progress(&self) -> bool {
        self.input.is_source()
    }

    fn step(&mut self) -> Result<StepOutcome> {
        let len = self.input.len();
        if self.position >= len {
            return Ok(StepOutcome::Done);
        }
        let rows = self.input.read(self.position, self.batch)?;
        let end = (self.position + self.batch).min(len);
        let replayed = self.sink.is_some() && end <= self.delivered_upto;
        if !replayed {
            for row in rows {
                self.transform.apply(row, &mut self.pending);
            }
        }
        self.position = end;
        Ok(StepOutcome::Continue)
    }

    fn snapshot(&self) -> OperatorSnapshot {
        let emitted = if self.sink.is_some() {
            Vec::new()
        } else {
            self.pending.clone()
        };
        OperatorSnapshot::new(SnapshotBody::Rows {
            position: self.position,
            emitted,
        })
    }

    fn restore(&mut self, snapshot: OperatorSnapshot) -> Result<()> {
        match snapshot.body {
            SnapshotBody::Rows { position, emitted } => {
                self.position = position.min(self.input.len());
                self.pending = emitted;
                Ok(())
            }
            _ => Err(ExecError::checkpoint(
                &self.id,
                "expected a rows snapshot",
            )),
        }
    }

    fn reset(&mut self) {
        self.position = 0;
        self.pending.clear();
    }

    fn checkpoint_committed(&mut self) -> Result<()> {
        self.flush()
    }

    fn finish(mut self) -> Result<Vec<Row>> {
        if self.sink.is_some() {
            self.flush()?;
            return Ok(Vec::new());
        }
        Ok(self.pending)
    }
}

/// Accumulates partial aggregates over an input.
pub struct AggregateTask {
    id: OperatorId,
    input: RowInput,
    transform: RowTransform,
    table: GroupTable,
    batch: u64,
    position: u64,
    scratch: Vec<Row>,
}

impl AggregateTask {
    /// Creates a task folding `input` (after `transform`) into `table`.
    pub fn new(
        id: OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
        batch: usize,
    ) -> Self {
        Self {
            id,
            input,
            transform,
            table,
            batch: batch.max(1) as u64,
            position: 0,
            scratch: Vec::new(),
        }
    }
}

impl Resumable for AggregateTask {
    type Output = GroupTable;

    fn operator_id(&self) -> &OperatorId {
        &self.id
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn counts_toward_progress(&self) -> bool {
        self.input.is_source()
    }

    fn step(&mut self) -> Result<StepOutcome> {
        let len = self.input.len();
        if self.position >= len {
            return Ok(StepOutcome::Done);
        }
        let rows = self.input.read(self.position, self.batch)?;
        for row in rows {
            self.transform.apply(row, &mut self.scratch);
        }
        for row in self.scratch.drain(..) {
            self.table.accumulate(&row);
        }
        self.position = (self.position + self.batch).min(len);
        Ok(StepOutcome::Continue)
    }

    fn snapshot(&self) -> OperatorSnapshot {
        OperatorSnapshot::new(SnapshotBody::Aggregate {
            position: self.position,
            groups: self.table.snapshot(),
        })
    }

    fn restore(&mut self, snapshot: OperatorSnapshot) -> Result<()> {
        match snapshot.body {
            SnapshotBody::Aggregate { position, groups } => {
                self.table.clear();
                self.table.restore(groups);
                self.position = position.min(self.input.len());
                Ok(())
            }
            _ => Err(ExecError::checkpoint(
                &self.id,
                "expected an aggregate snapshot",
            )),
        }
    }

    fn reset(&mut self) {
        self.table.clear();
        self.position = 0;
    }

    fn finish(self) -> Result<GroupTable> {
        Ok(self.table)
    }
}
