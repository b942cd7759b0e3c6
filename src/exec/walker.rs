//! Lowers a finite plan tree onto an execution backend.

use std::sync::Arc;

use crate::ops::{sort_rows, GroupTable, RowInput, RowSink, RowTransform};
use crate::plan::{PlanNode, PlanOp, SourceRegistry};
use crate::progress::ProgressTracker;
use crate::types::{ExecError, OperatorId, Result, Row};

/// Operator kernels a strategy provides. Each call is an operator boundary.
pub(crate) trait Backend {
    /// Streams `input` through `transform`. With a sink, rows are delivered
    /// there and the returned vector is empty.
    fn pipeline(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>>;

    /// Equi-joins two materialized inputs.
    fn hash_join(
        &self,
        id: &OperatorId,
        left: Vec<Row>,
        right: Vec<Row>,
        left_key: &str,
        right_key: &str,
    ) -> Result<Vec<Row>>;

    /// Folds `input` into `table` and returns one row per group.
    fn aggregate(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
    ) -> Result<Vec<Row>>;
}

/// Scan-side chain of row transforms ending in a replayable input.
struct Lowered {
    id: OperatorId,
    input: RowInput,
    transform: RowTransform,
}

impl Lowered {
    fn is_materialized(&self) -> bool {
        !self.input.is_source() && self.transform.is_identity()
    }
}

/// Walks a plan bottom-up. Filters and projections fuse into the task below
/// them; joins, aggregations, sorts and limits materialize their output.
pub(crate) struct PlanWalker<'a, B: Backend + ?Sized> {
    backend: &'a B,
    sources: &'a SourceRegistry,
    batch_size: usize,
    progress: Option<Arc<ProgressTracker>>,
}

impl<'a, B: Backend + ?Sized> PlanWalker<'a, B> {
    pub(crate) fn new(backend: &'a B, sources: &'a SourceRegistry, batch_size: usize) -> Self {
        Self {
            backend,
            sources,
            batch_size: batch_size.max(1),
            progress: None,
        }
    }

    pub(crate) fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs `root`, delivering its rows to `sink` in batches.
    pub(crate) fn run(&self, root: &PlanNode, sink: &RowSink) -> Result<()> {
        if fuses(&root.op) {
            let lowered = self.lower(root)?;
            self.phase(&root.op);
            if lowered.is_materialized() {
                let rows = lowered.input.read(0, lowered.input.len())?;
                return send_batches(rows, self.batch_size, sink);
            }
            self.backend
                .pipeline(&lowered.id, lowered.input, lowered.transform, Some(sink))?;
            return Ok(());
        }
        let rows = self.evaluate(root)?;
        send_batches(rows, self.batch_size, sink)
    }

    /// Runs `node` and returns all of its rows.
    pub(crate) fn evaluate(&self, node: &PlanNode) -> Result<Vec<Row>> {
        match &node.op {
            PlanOp::Scan { .. }
            | PlanOp::IndexScan { .. }
            | PlanOp::Filter { .. }
            | PlanOp::Project { .. } => {
                let lowered = self.lower(node)?;
                self.phase(&node.op);
                if lowered.is_materialized() {
                    return lowered.input.read(0, lowered.input.len());
                }
                self.backend
                    .pipeline(&lowered.id, lowered.input, lowered.transform, None)
            }
            PlanOp::HashJoin {
                left_key,
                right_key,
            } => {
                let [left, right] = node.inputs.as_slice() else {
                    return Err(ExecError::fatal(&node.id, "hash join needs two inputs"));
                };
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                self.phase(&node.op);
                self.backend
                    .hash_join(&node.id, left, right, left_key, right_key)
            }
            PlanOp::Aggregate {
                group_by,
                aggregates,
            } => {
                let lowered = self.lower(single_input(node)?)?;
                self.phase(&node.op);
                let table = GroupTable::new(group_by.clone(), aggregates.clone());
                self.backend
                    .aggregate(&node.id, lowered.input, lowered.transform, table)
            }
            PlanOp::Sort { keys } => {
                let mut rows = self.evaluate(single_input(node)?)?;
                self.phase(&node.op);
                sort_rows(&mut rows, keys);
                Ok(rows)
            }
            PlanOp::Limit { count } => {
                let mut rows = self.evaluate(single_input(node)?)?;
                rows.truncate(*count);
                Ok(rows)
            }
            PlanOp::StreamSource { .. }
            | PlanOp::WindowAggregate { .. }
            | PlanOp::StreamJoin { .. } => Err(ExecError::fatal(
                &node.id,
                format!("streaming operator {} in a finite plan", node.op.name()),
            )),
        }
    }

    fn lower(&self, node: &PlanNode) -> Result<Lowered> {
        match &node.op {
            PlanOp::Scan { table } => Ok(Lowered {
                id: node.id.clone(),
                input: RowInput::source(self.sources.resolve(&node.id, table)?, None),
                transform: RowTransform::Identity,
            }),
            PlanOp::IndexScan { table } => Ok(Lowered {
                id: node.id.clone(),
                input: RowInput::source(
                    self.sources.resolve(&node.id, table)?,
                    node.access_path.clone(),
                ),
                transform: RowTransform::Identity,
            }),
            PlanOp::Filter { predicate } => {
                let mut lowered = self.lower(single_input(node)?)?;
                lowered.id = node.id.clone();
                lowered.transform = lowered
                    .transform
                    .then(RowTransform::Filter(predicate.clone()));
                Ok(lowered)
            }
            PlanOp::Project { columns } => {
                let mut lowered = self.lower(single_input(node)?)?;
                lowered.id = node.id.clone();
                lowered.transform = lowered
                    .transform
                    .then(RowTransform::Project(columns.clone()));
                Ok(lowered)
            }
            _ => Ok(Lowered {
                id: node.id.clone(),
                input: RowInput::rows(self.evaluate(node)?),
                transform: RowTransform::Identity,
            }),
        }
    }

    fn phase(&self, op: &PlanOp) {
        if let Some(progress) = &self.progress {
            progress.set_phase(op.name());
        }
    }
}

fn fuses(op: &PlanOp) -> bool {
    matches!(
        op,
        PlanOp::Scan { .. } | PlanOp::IndexScan { .. } | PlanOp::Filter { .. } | PlanOp::Project { .. }
    )
}

fn single_input(node: &PlanNode) -> Result<&PlanNode> {
    match node.inputs.as_slice() {
        [child] => Ok(child),
        _ => Err(ExecError::fatal(
            &node.id,
            format!("{} needs exactly one input", node.op.name()),
        )),
    }
}

/// Sends materialized rows to `sink`, `batch` rows at a time.
pub(crate) fn send_batches(rows: Vec<Row>, batch: usize, sink: &RowSink) -> Result<()> {
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<Row> = rows.by_ref().take(batch.max(1)).collect();
        sink.send(chunk).map_err(|_| ExecError::Cancelled)?;
    }
    Ok(())
}
