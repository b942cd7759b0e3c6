//! Cooperative event loop driving streaming operators.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StreamingOptions;
use crate::exec::CancellationToken;
use crate::fault::{CheckpointRecord, FaultTolerantShell};
use crate::ops::RowTransform;
use crate::plan::{PlanNode, PlanOp};
use crate::streaming::buffer::StreamEvent;
use crate::streaming::join::{JoinSide, MatchHandler, StreamJoin};
use crate::streaming::registry::StreamRegistry;
use crate::streaming::window::{WindowResult, WindowedAggregator};
use crate::types::{ExecError, OperatorId, Result, Row};

/// A stream source with the row transforms stacked on it.
#[derive(Clone)]
struct SourceChain {
    stream: String,
    transform: RowTransform,
}

enum Operator {
    Passthrough(SourceChain),
    Window {
        input: SourceChain,
        aggregator: WindowedAggregator,
    },
    Join {
        left: SourceChain,
        right: SourceChain,
        join: StreamJoin,
    },
}

/// Lowered streaming plan: one stateful operator plus a transform on its
/// output rows.
pub struct StreamPlan {
    id: OperatorId,
    operator: Operator,
    output: RowTransform,
}

impl StreamPlan {
    /// Lowers a plan rooted at `root`. Join buffers get `capacity` events
    /// per side.
    pub fn lower(root: &PlanNode, capacity: usize) -> Result<Self> {
        match &root.op {
            PlanOp::Filter { .. } | PlanOp::Project { .. } => {
                if let Ok(chain) = lower_source(root) {
                    return Ok(Self {
                        id: root.id.clone(),
                        operator: Operator::Passthrough(chain),
                        output: RowTransform::Identity,
                    });
                }
                let child = single_input(root)?;
                let mut plan = Self::lower(child, capacity)?;
                plan.output = plan.output.then(transform_of(&root.op)?);
                Ok(plan)
            }
            PlanOp::StreamSource { .. } => Ok(Self {
                id: root.id.clone(),
                operator: Operator::Passthrough(lower_source(root)?),
                output: RowTransform::Identity,
            }),
            PlanOp::WindowAggregate {
                window_ms,
                slide_ms,
                group_by,
                aggregates,
            } => {
                let input = lower_source(single_input(root)?)?;
                let aggregator = WindowedAggregator::new(
                    root.id.clone(),
                    millis(*window_ms),
                    millis(*slide_ms),
                    group_by.clone(),
                    aggregates.clone(),
                )?;
                Ok(Self {
                    id: root.id.clone(),
                    operator: Operator::Window { input, aggregator },
                    output: RowTransform::Identity,
                })
            }
            PlanOp::StreamJoin {
                left_key,
                right_key,
                window_ms,
            } => {
                let [left, right] = root.inputs.as_slice() else {
                    return Err(ExecError::fatal(&root.id, "stream join needs two inputs"));
                };
                let left = lower_source(left)?;
                let right = lower_source(right)?;
                let join = StreamJoin::new(
                    &left.stream,
                    left_key.clone(),
                    &right.stream,
                    right_key.clone(),
                    millis(*window_ms),
                    capacity,
                );
                Ok(Self {
                    id: root.id.clone(),
                    operator: Operator::Join { left, right, join },
                    output: RowTransform::Identity,
                })
            }
            other => Err(ExecError::fatal(
                &root.id,
                format!("operator {} cannot run on a stream", other.name()),
            )),
        }
    }

    /// Claims the plan's input streams. Fails when another query already
    /// consumes one of them.
    pub fn take_inputs(&self, registry: &StreamRegistry) -> Result<StreamInputs> {
        let mut inputs = Vec::new();
        for stream in self.streams() {
            inputs.push(registry.take_receiver(&stream)?);
        }
        Ok(StreamInputs(inputs))
    }

    /// Streams the plan reads, deduplicated.
    pub fn streams(&self) -> Vec<String> {
        let mut streams = match &self.operator {
            Operator::Passthrough(input) | Operator::Window { input, .. } => {
                vec![input.stream.clone()]
            }
            Operator::Join { left, right, .. } => vec![left.stream.clone(), right.stream.clone()],
        };
        streams.dedup();
        streams
    }
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
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

fn transform_of(op: &PlanOp) -> Result<RowTransform> {
    match op {
        PlanOp::Filter { predicate } => Ok(RowTransform::Filter(predicate.clone())),
        PlanOp::Project { columns } => Ok(RowTransform::Project(columns.clone())),
        other => Err(ExecError::config(format!(
            "{} is not a row transform",
            other.name()
        ))),
    }
}

fn lower_source(node: &PlanNode) -> Result<SourceChain> {
    match &node.op {
        PlanOp::StreamSource { stream } => Ok(SourceChain {
            stream: stream.clone(),
            transform: RowTransform::Identity,
        }),
        PlanOp::Filter { .. } | PlanOp::Project { .. } => {
            let mut chain = lower_source(single_input(node)?)?;
            chain.transform = chain.transform.then(transform_of(&node.op)?);
            Ok(chain)
        }
        other => Err(ExecError::fatal(
            &node.id,
            format!("expected a stream source, found {}", other.name()),
        )),
    }
}

/// Input streams claimed by one streaming query.
pub struct StreamInputs(Vec<UnboundedReceiver<StreamEvent>>);

/// Runs one streaming query on a single-threaded cooperative loop.
///
/// Operators only suspend while awaiting the next event. Checkpoint writes
/// run on the blocking pool so they never stall event processing; at most
/// one is in flight and a due checkpoint is skipped while one is.
pub struct StreamingEngine {
    shell: Arc<FaultTolerantShell>,
    options: StreamingOptions,
    cancel: CancellationToken,
    match_handler: Option<MatchHandler>,
}

struct LoopState {
    events: u64,
    sequence: u64,
    in_flight: Option<JoinHandle<()>>,
    results_open: bool,
}

impl StreamingEngine {
    /// Creates an engine for one query.
    pub fn new(
        shell: Arc<FaultTolerantShell>,
        options: StreamingOptions,
        cancel: CancellationToken,
        match_handler: Option<MatchHandler>,
    ) -> Self {
        Self {
            shell,
            options,
            cancel,
            match_handler,
        }
    }

    /// Runs until every input ends or the query is cancelled. Open windows
    /// are flushed in both cases.
    pub fn run(
        self,
        mut plan: StreamPlan,
        inputs: StreamInputs,
        results: Sender<Vec<Row>>,
    ) -> Result<()> {
        let inputs = inputs.0;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on(async move { self.event_loop(&mut plan, inputs, results).await })
    }

    async fn event_loop(
        &self,
        plan: &mut StreamPlan,
        inputs: Vec<UnboundedReceiver<StreamEvent>>,
        results: Sender<Vec<Row>>,
    ) -> Result<()> {
        let (merged_tx, mut merged) = mpsc::unbounded_channel();
        for mut input in inputs {
            let tx = merged_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = input.recv().await {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
        }
        drop(merged_tx);

        self.resume(plan);
        info!(
            query_id = %self.shell.query_id(),
            operator = %plan.id,
            streams = ?plan.streams(),
            "streaming.loop.started"
        );

        let mut state = LoopState {
            events: 0,
            sequence: 0,
            in_flight: None,
            results_open: true,
        };
        let cancelled = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break true,
                next = merged.recv() => match next {
                    Some(event) => {
                        self.on_event(plan, event, &results, &mut state);
                        state.events += 1;
                        if state.events % self.options.checkpoint_every_events.max(1) == 0 {
                            self.checkpoint(plan, &mut state);
                        }
                    }
                    None => break false,
                },
            }
        };

        if let Operator::Window { aggregator, .. } = &mut plan.operator {
            let flushed = aggregator.flush();
            self.emit_windows(&plan.output, flushed, &results, &mut state);
        }
        if let Operator::Join { join, .. } = &mut plan.operator {
            join.clear();
        }
        if let Some(handle) = state.in_flight.take() {
            let _ = handle.await;
        }
        info!(
            query_id = %self.shell.query_id(),
            events = state.events,
            cancelled,
            "streaming.loop.stopped"
        );
        if cancelled {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn on_event(
        &self,
        plan: &mut StreamPlan,
        event: StreamEvent,
        results: &Sender<Vec<Row>>,
        state: &mut LoopState,
    ) {
        let stats = self.shell.stats();
        match &mut plan.operator {
            Operator::Passthrough(input) => {
                if event.stream != input.stream {
                    return;
                }
                let mut rows = Vec::new();
                input.transform.apply(event.row, &mut rows);
                let rows = apply_all(&plan.output, rows);
                send(results, rows, state);
            }
            Operator::Window { input, aggregator } => {
                if event.stream != input.stream {
                    return;
                }
                let mut rows = Vec::new();
                input.transform.apply(event.row, &mut rows);
                let mut closed = Vec::new();
                if rows.is_empty() {
                    closed.extend(aggregator.advance(event.timestamp_ms));
                }
                for row in &rows {
                    let (done, accepted) = aggregator.on_event(event.timestamp_ms, row);
                    closed.extend(done);
                    if !accepted {
                        stats.add_late_events_dropped(1);
                    }
                }
                self.emit_windows(&plan.output, closed, results, state);
            }
            Operator::Join { left, right, join } => {
                let mut sides = Vec::with_capacity(2);
                if event.stream == left.stream {
                    sides.push((JoinSide::Left, &left.transform));
                }
                if event.stream == right.stream {
                    sides.push((JoinSide::Right, &right.transform));
                }
                for (side, transform) in sides {
                    let mut rows = Vec::new();
                    transform.apply(event.row.clone(), &mut rows);
                    for row in rows {
                        let step = join.on_event(
                            side,
                            StreamEvent::new(event.stream.clone(), event.timestamp_ms, row),
                        );
                        if step.overflowed > 0 {
                            stats.add_stream_events_dropped(step.overflowed);
                        }
                        for m in &step.matches {
                            self.notify_match(m);
                        }
                    }
                }
            }
        }
    }

    fn notify_match(&self, m: &crate::streaming::join::StreamMatch) {
        let Some(handler) = &self.match_handler else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(m))).is_err() {
            warn!(query_id = %self.shell.query_id(), "streaming.join.handler_panicked");
        }
    }

    fn emit_windows(
        &self,
        output: &RowTransform,
        windows: Vec<WindowResult>,
        results: &Sender<Vec<Row>>,
        state: &mut LoopState,
    ) {
        for window in windows {
            debug!(
                start = window.start,
                end = window.end,
                groups = window.rows.len(),
                "streaming.window.emitted"
            );
            let rows = apply_all(output, window.rows);
            send(results, rows, state);
        }
    }

    /// Restores a window checkpoint left by an earlier run.
    fn resume(&self, plan: &mut StreamPlan) {
        let Operator::Window { aggregator, .. } = &mut plan.operator else {
            return;
        };
        let store = self.shell.store();
        match store.read_latest(self.shell.query_id(), &plan.id) {
            Ok(Some(record)) => match aggregator.restore(record.snapshot) {
                Ok(()) => {
                    self.shell.stats().add_operators_resumed(1);
                    info!(operator = %plan.id, sequence = record.sequence, "streaming.window.resumed");
                }
                Err(err) => {
                    error!(operator = %plan.id, error = %err, "fault.checkpoint.restore_failed");
                }
            },
            Ok(None) => {}
            Err(err) => {
                error!(operator = %plan.id, error = %err, "fault.checkpoint.read_failed");
            }
        }
    }

    fn checkpoint(&self, plan: &StreamPlan, state: &mut LoopState) {
        let Operator::Window { aggregator, .. } = &plan.operator else {
            return;
        };
        if state.in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(operator = %plan.id, "streaming.checkpoint.skipped");
            return;
        }
        state.sequence += 1;
        let record = CheckpointRecord::new(
            self.shell.query_id().clone(),
            plan.id.clone(),
            state.sequence,
            aggregator.snapshot(),
        );
        let store = Arc::clone(self.shell.store());
        let stats = Arc::clone(self.shell.stats());
        state.in_flight = Some(tokio::task::spawn_blocking(move || {
            match store.write(&record) {
                Ok(()) => {
                    stats.add_checkpoints_written(1);
                    debug!(
                        operator = %record.operator_id,
                        sequence = record.sequence,
                        "fault.checkpoint.written"
                    );
                }
                Err(err) => {
                    stats.add_checkpoints_failed(1);
                    warn!(
                        operator = %record.operator_id,
                        sequence = record.sequence,
                        error = %err,
                        "fault.checkpoint.write_failed"
                    );
                }
            }
        }));
    }
}

fn apply_all(transform: &RowTransform, rows: Vec<Row>) -> Vec<Row> {
    if transform.is_identity() {
        return rows;
    }
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        transform.apply(row, &mut out);
    }
    out
}

fn send(results: &Sender<Vec<Row>>, rows: Vec<Row>, state: &mut LoopState) {
    if rows.is_empty() || !state.results_open {
        return;
    }
    if results.send(rows).is_err() {
        state.results_open = false;
        debug!("streaming.results.receiver_dropped");
    }
}
