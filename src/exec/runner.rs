//! Per-strategy execution on the query's runner thread.

use std::sync::mpsc::{Sender, SyncSender};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bridge::{ExecutionStrategy, OptimizedPlan, ResultCache};
use crate::config::ExecConfig;
use crate::exec::serial::SerialEngine;
use crate::exec::walker::{send_batches, Backend, PlanWalker};
use crate::exec::CancellationToken;
use crate::fault::FaultTolerantShell;
use crate::ops::{GroupTable, RowInput, RowSink, RowTransform};
use crate::parallel::ParallelEngine;
use crate::plan::SourceRegistry;
use crate::progress::ProgressTracker;
use crate::streaming::{MatchHandler, StreamInputs, StreamPlan, StreamingEngine};
use crate::types::{ExecError, OperatorId, Result, Row};

/// Everything one run owns. Dropped when the runner thread exits.
pub(crate) struct QueryRun {
    pub(crate) optimized: OptimizedPlan,
    pub(crate) config: ExecConfig,
    pub(crate) sources: SourceRegistry,
    pub(crate) shell: Arc<FaultTolerantShell>,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cache: Option<Arc<dyn ResultCache>>,
}

/// Where a run delivers its rows.
pub(crate) enum Output {
    /// Bounded channel for finite strategies.
    Finite(SyncSender<Vec<Row>>),
    /// Streaming results plus the claimed inputs.
    Streaming {
        results: Sender<Vec<Row>>,
        plan: StreamPlan,
        inputs: StreamInputs,
        match_handler: Option<MatchHandler>,
    },
}

impl QueryRun {
    /// Runs to a terminal outcome and settles checkpoints and progress.
    pub(crate) fn execute(self, output: Output) -> Result<()> {
        self.progress.start();
        let outcome = match output {
            Output::Finite(sink) => self.run_finite(&sink),
            Output::Streaming {
                results,
                plan,
                inputs,
                match_handler,
            } => {
                self.progress.set_phase("streaming");
                StreamingEngine::new(
                    Arc::clone(&self.shell),
                    self.config.streaming.clone(),
                    self.cancel.clone(),
                    match_handler,
                )
                .run(plan, inputs, results)
            }
        };
        self.settle(&outcome);
        outcome
    }

    fn run_finite(&self, sink: &RowSink) -> Result<()> {
        let optimized = &self.optimized;
        match optimized.strategy {
            ExecutionStrategy::Cached => {
                let rows = optimized.cached.as_deref().cloned().unwrap_or_default();
                self.progress.set_phase("cached");
                self.progress.add_rows(rows.len() as u64);
                send_batches(rows, self.config.batch_size, sink)
            }
            ExecutionStrategy::Serial => self.walk(&self.serial(), sink),
            ExecutionStrategy::Parallel => {
                match ParallelEngine::new(
                    optimized.degree,
                    &self.config,
                    Arc::clone(&self.shell),
                    self.cancel.clone(),
                ) {
                    Ok(engine) => {
                        let outcome = self.walk(&engine, sink);
                        engine.shutdown();
                        outcome
                    }
                    Err(err) => {
                        warn!(
                            query_id = %self.shell.query_id(),
                            from = %ExecutionStrategy::Parallel,
                            to = %ExecutionStrategy::Serial,
                            error = %err,
                            "exec.bridge.downgrade"
                        );
                        self.walk(&self.serial(), sink)
                    }
                }
            }
            ExecutionStrategy::Adaptive => {
                let backend = AdaptiveBackend::new(self);
                let outcome = self.walk(&backend, sink);
                backend.shutdown();
                outcome
            }
            ExecutionStrategy::Streaming => Err(ExecError::config(
                "streaming plan submitted without stream inputs",
            )),
        }
    }

    fn serial(&self) -> SerialEngine {
        SerialEngine::new(
            Arc::clone(&self.shell),
            self.cancel.clone(),
            self.config.batch_size,
        )
    }

    /// Walks the plan on `backend`. With write-through caching the result is
    /// materialized first so the complete set can be stored.
    fn walk<B: Backend + ?Sized>(&self, backend: &B, sink: &RowSink) -> Result<()> {
        let walker = PlanWalker::new(backend, &self.sources, self.config.batch_size)
            .with_progress(Arc::clone(&self.progress));
        let root = &self.optimized.plan.root;
        let (Some(cache), Some(ttl)) = (&self.cache, self.optimized.cache_ttl) else {
            return walker.run(root, sink);
        };
        let rows = Arc::new(walker.evaluate(root)?);
        cache.put(self.optimized.fingerprint, Arc::clone(&rows), ttl);
        let rows = Arc::try_unwrap(rows).unwrap_or_else(|shared| (*shared).clone());
        send_batches(rows, self.config.batch_size, sink)
    }

    fn settle(&self, outcome: &Result<()>) {
        let query_id = self.shell.query_id();
        match outcome {
            Ok(()) => {
                self.shell.clear_checkpoints();
                self.progress.complete();
                info!(
                    query_id = %query_id,
                    strategy = %self.optimized.strategy,
                    stats = ?self.shell.stats().snapshot(),
                    "exec.query.completed"
                );
            }
            Err(ExecError::Cancelled) => {
                self.shell.clear_checkpoints();
                self.progress.cancel();
                info!(query_id = %query_id, "exec.query.cancelled");
            }
            Err(err) => {
                // Checkpoints stay so a resubmission under this id resumes.
                self.progress.fail();
                error!(
                    query_id = %query_id,
                    operator = ?err.operator_id(),
                    kind = %err.kind(),
                    error = %err,
                    "exec.query.failed"
                );
            }
        }
    }
}

enum AdaptiveState {
    Serial,
    Parallel(Arc<ParallelEngine>),
    /// Switching failed; stay serial for the rest of the run.
    Pinned,
}

/// Starts serial and switches to parallel at the first operator boundary
/// where the observed input exceeds the row threshold. Never switches back.
struct AdaptiveBackend<'a> {
    run: &'a QueryRun,
    serial: SerialEngine,
    state: Mutex<AdaptiveState>,
}

impl<'a> AdaptiveBackend<'a> {
    fn new(run: &'a QueryRun) -> Self {
        Self {
            run,
            serial: run.serial(),
            state: Mutex::new(AdaptiveState::Serial),
        }
    }

    fn parallel_for(&self, id: &OperatorId, observed: u64) -> Option<Arc<ParallelEngine>> {
        let mut state = self.state.lock();
        match &*state {
            AdaptiveState::Parallel(engine) => return Some(Arc::clone(engine)),
            AdaptiveState::Pinned => return None,
            AdaptiveState::Serial if observed <= self.run.config.parallel_row_threshold => {
                return None
            }
            AdaptiveState::Serial => {}
        }
        let fan_out = observed / self.run.config.min_rows_per_partition;
        let degree = self
            .run
            .optimized
            .degree
            .min(usize::try_from(fan_out).unwrap_or(usize::MAX))
            .max(1);
        let shell = &self.run.shell;
        match ParallelEngine::new(degree, &self.run.config, Arc::clone(shell), self.run.cancel.clone()) {
            Ok(engine) => {
                info!(
                    query_id = %shell.query_id(),
                    operator = %id,
                    observed_rows = observed,
                    degree,
                    "exec.adaptive.switch"
                );
                shell.stats().add_strategy_switches(1);
                let engine = Arc::new(engine);
                *state = AdaptiveState::Parallel(Arc::clone(&engine));
                Some(engine)
            }
            Err(err) => {
                warn!(
                    query_id = %shell.query_id(),
                    operator = %id,
                    error = %err,
                    "exec.adaptive.switch_failed"
                );
                *state = AdaptiveState::Pinned;
                None
            }
        }
    }

    fn shutdown(self) {
        if let AdaptiveState::Parallel(engine) = self.state.into_inner() {
            if let Ok(engine) = Arc::try_unwrap(engine) {
                engine.shutdown();
            }
        }
    }
}

impl Backend for AdaptiveBackend<'_> {
    fn pipeline(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>> {
        match self.parallel_for(id, input.len()) {
            Some(engine) => engine.pipeline(id, input, transform, sink),
            None => self.serial.pipeline(id, input, transform, sink),
        }
    }

    fn hash_join(
        &self,
        id: &OperatorId,
        left: Vec<Row>,
        right: Vec<Row>,
        left_key: &str,
        right_key: &str,
    ) -> Result<Vec<Row>> {
        let observed = (left.len() + right.len()) as u64;
        match self.parallel_for(id, observed) {
            Some(engine) => Backend::hash_join(&*engine, id, left, right, left_key, right_key),
            None => self.serial.hash_join(id, left, right, left_key, right_key),
        }
    }

    fn aggregate(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
    ) -> Result<Vec<Row>> {
        match self.parallel_for(id, input.len()) {
            Some(engine) => Backend::aggregate(&*engine, id, input, transform, table),
            None => self.serial.aggregate(id, input, transform, table),
        }
    }
}
