#![forbid(unsafe_code)]

//! Query submission and the per-query runtime.
//!
//! [`QueryExecutor::submit`] asks the strategy bridge for an
//! [`OptimizedPlan`], builds the query's own shell, progress tracker,
//! cancellation token and result channel, then runs the plan on a dedicated
//! runner thread. Worker pools are created by that thread and torn down
//! before it reports a terminal status; nothing is shared across queries
//! except the checkpoint store, whose keys are scoped by query id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::bridge::{
    ExecutionStrategy, LruResultCache, OptimizedPlan, ResultCache, RuntimeHints, StrategyBridge,
};
use crate::config::ExecConfig;
use crate::fault::{
    CheckpointStore, FailureDetector, FaultTolerantShell, InMemoryCheckpointStore, RecoveryHandler,
};
use crate::plan::{Plan, SourceRegistry};
use crate::progress::ProgressTracker;
use crate::streaming::{StreamPlan, StreamRegistry};
use crate::types::{QueryId, Result, Row};

mod cancel;
mod handle;
mod runner;
mod serial;
mod stats;
mod walker;

pub use cancel::CancellationToken;
pub use handle::{ExecutionHandle, ExecutionStatus, NextRow, ResultStream};
pub use serial::SerialEngine;
pub use stats::{ExecutionStats, StatsSnapshot};
pub(crate) use walker::Backend;

use handle::StatusCell;
use runner::{Output, QueryRun};

/// Entry point for running plans.
pub struct QueryExecutor {
    config: ExecConfig,
    bridge: StrategyBridge,
    sources: SourceRegistry,
    streams: StreamRegistry,
    store: Arc<dyn CheckpointStore>,
    recovery: Option<Arc<dyn RecoveryHandler>>,
    submitted: AtomicU64,
}

impl QueryExecutor {
    /// Creates an executor reading tables from `sources`, with an in-memory
    /// checkpoint store and result cache.
    pub fn new(config: ExecConfig, sources: SourceRegistry) -> Self {
        let store = Arc::new(InMemoryCheckpointStore::new(config.checkpoint.retention));
        let cache: Arc<dyn ResultCache> = Arc::new(LruResultCache::default());
        Self {
            bridge: StrategyBridge::new(config.clone(), Some(cache)),
            config,
            sources,
            streams: StreamRegistry::new(),
            store,
            recovery: None,
            submitted: AtomicU64::new(0),
        }
    }

    /// Replaces the checkpoint store.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the result cache; `None` disables caching.
    pub fn with_result_cache(mut self, cache: Option<Arc<dyn ResultCache>>) -> Self {
        self.bridge = StrategyBridge::new(self.config.clone(), cache);
        self
    }

    /// Installs the handler run when an operator exhausts its retries.
    pub fn with_recovery_handler<H>(mut self, handler: H) -> Self
    where
        H: RecoveryHandler + 'static,
    {
        self.recovery = Some(Arc::new(handler));
        self
    }

    /// Uses an existing stream registry.
    pub fn with_streams(mut self, streams: StreamRegistry) -> Self {
        self.streams = streams;
        self
    }

    /// Live inputs for streaming plans.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Tables available to scans.
    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// The strategy bridge.
    pub fn bridge(&self) -> &StrategyBridge {
        &self.bridge
    }

    /// Submits `plan` under a fresh query id.
    pub fn submit(&self, plan: Plan) -> Result<ExecutionHandle> {
        self.submit_with(plan, RuntimeHints::default())
    }

    /// Submits `plan` with explicit runtime hints.
    pub fn submit_with(&self, plan: Plan, hints: RuntimeHints) -> Result<ExecutionHandle> {
        let id = self.next_query_id();
        self.submit_with_id(id, plan, hints)
    }

    /// Submits `plan` under `query_id`. Checkpoints left by a failed run with
    /// the same id are resumed from.
    pub fn submit_with_id(
        &self,
        query_id: QueryId,
        plan: Plan,
        hints: RuntimeHints,
    ) -> Result<ExecutionHandle> {
        let optimized = self.bridge.select(&plan, &hints)?;
        let progress = Arc::new(ProgressTracker::new(
            optimized.estimated_rows,
            self.config.progress.clone(),
        ));
        let stats = Arc::new(ExecutionStats::default());
        let detector = Arc::new(FailureDetector::new(&self.config.detector));
        let shell = Arc::new(
            FaultTolerantShell::new(
                query_id.clone(),
                Arc::clone(&self.store),
                self.config.checkpoint.clone(),
                self.config.retry.clone(),
                detector,
                stats,
            )
            .with_recovery(self.recovery.clone())
            .with_progress(Arc::clone(&progress)),
        );
        let cancel = CancellationToken::new();

        let (output, results) = self.output_for(&optimized)?;
        let run = QueryRun {
            config: self.config.clone(),
            sources: self.sources.clone(),
            shell: Arc::clone(&shell),
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
            cache: self.bridge.cache().cloned(),
            optimized,
        };
        let strategy = run.optimized.strategy;
        let degree = run.optimized.degree;
        let status = Arc::new(StatusCell::default());

        let published = Arc::clone(&status);
        let runner_id = query_id.clone();
        thread::Builder::new()
            .name(format!("lakeflow-query-{query_id}"))
            .spawn(move || {
                let outcome = run.execute(output);
                debug!(query_id = %runner_id, "exec.runner.exited");
                published.publish(ExecutionStatus::from_outcome(&outcome));
            })?;
        info!(query_id = %query_id, strategy = %strategy, degree, "exec.query.submitted");

        Ok(ExecutionHandle::new(
            query_id, strategy, degree, results, progress, shell, cancel, status,
        ))
    }

    fn output_for(&self, optimized: &OptimizedPlan) -> Result<(Output, mpsc::Receiver<Vec<Row>>)> {
        if optimized.strategy != ExecutionStrategy::Streaming {
            let (tx, rx) = mpsc::sync_channel(self.config.channel_capacity);
            return Ok((Output::Finite(tx), rx));
        }
        let plan = StreamPlan::lower(&optimized.plan.root, optimized.buffer_capacity)?;
        let inputs = plan.take_inputs(&self.streams)?;
        let (tx, rx) = mpsc::channel();
        let output = Output::Streaming {
            results: tx,
            plan,
            inputs,
            match_handler: self.streams.match_handler(),
        };
        Ok((output, rx))
    }

    fn next_query_id(&self) -> QueryId {
        let n = self.submitted.fetch_add(1, Ordering::Relaxed);
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        QueryId(format!("q-{epoch_ms}-{n}"))
    }
}
