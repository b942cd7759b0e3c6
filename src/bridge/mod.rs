#![forbid(unsafe_code)]

//! Strategy selection.
//!
//! The bridge turns a submitted [`Plan`] into exactly one [`OptimizedPlan`]:
//! the strategy to run it with and the resources that strategy gets. Rules
//! are applied in order:
//!
//! 1. a valid cached result for the plan's fingerprint selects `Cached`;
//! 2. a plan reading a live source selects `Streaming`;
//! 3. a large plan with a join or aggregation selects `Parallel`;
//! 4. with adaptive execution enabled, remaining join or aggregation plans
//!    select `Adaptive`, which starts serial and may switch at runtime;
//! 5. everything else runs `Serial`.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ExecConfig;
use crate::plan::Plan;
use crate::types::{Result, Row};

mod cache;

pub use cache::{LruResultCache, ResultCache};

/// How a plan is executed. Chosen once per submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStrategy {
    /// On the caller's runner thread.
    Serial,
    /// Partitioned across per-query worker pools.
    Parallel,
    /// Continuously, on a cooperative event loop.
    Streaming,
    /// Replayed from the result cache.
    Cached,
    /// Serial until observed row counts justify going parallel.
    Adaptive,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStrategy::Serial => "serial",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Streaming => "streaming",
            ExecutionStrategy::Cached => "cached",
            ExecutionStrategy::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Facts about the runtime environment supplied at submission.
#[derive(Debug, Clone, Default)]
pub struct RuntimeHints {
    /// Worker threads the caller can spare; `None` means hardware concurrency.
    /// Zero forces serial execution.
    pub available_workers: Option<usize>,
    /// Skip the cache lookup, e.g. to refresh a cached result.
    pub bypass_cache: bool,
}

impl RuntimeHints {
    /// Hints limiting the worker count.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            available_workers: Some(workers),
            ..Self::default()
        }
    }
}

/// The runnable form of one submitted plan.
#[derive(Clone)]
pub struct OptimizedPlan {
    /// The submitted plan, unchanged.
    pub plan: Plan,
    /// Plan identity used for caching.
    pub fingerprint: u64,
    /// Selected strategy.
    pub strategy: ExecutionStrategy,
    /// Partitions per parallel operator; 1 for serial strategies.
    pub degree: usize,
    /// Per-stream buffer capacity for streaming plans.
    pub buffer_capacity: usize,
    /// Optimizer estimate of input rows, used for progress.
    pub estimated_rows: u64,
    /// Write-through expiry; `None` disables caching of this run's result.
    pub cache_ttl: Option<Duration>,
    /// The cached result, for `Cached` plans.
    pub cached: Option<Arc<Vec<Row>>>,
}

impl fmt::Debug for OptimizedPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizedPlan")
            .field("fingerprint", &self.fingerprint)
            .field("strategy", &self.strategy)
            .field("degree", &self.degree)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("estimated_rows", &self.estimated_rows)
            .field("cache_ttl", &self.cache_ttl)
            .field("cached_rows", &self.cached.as_ref().map(|rows| rows.len()))
            .finish()
    }
}

/// Picks execution strategies and resources.
pub struct StrategyBridge {
    config: ExecConfig,
    cache: Option<Arc<dyn ResultCache>>,
}

impl StrategyBridge {
    /// Creates a bridge. `cache` is only consulted when caching is enabled.
    pub fn new(config: ExecConfig, cache: Option<Arc<dyn ResultCache>>) -> Self {
        Self { config, cache }
    }

    /// Configuration the bridge sizes resources from.
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Result cache in use, if any.
    pub fn cache(&self) -> Option<&Arc<dyn ResultCache>> {
        self.cache.as_ref()
    }

    /// Selects a strategy for `plan`. Invalid configuration fails here,
    /// before anything starts.
    pub fn select(&self, plan: &Plan, hints: &RuntimeHints) -> Result<OptimizedPlan> {
        self.config.validate()?;
        let fingerprint = plan.fingerprint();
        let estimated_rows = plan.estimated_input_rows();
        let mut optimized = OptimizedPlan {
            plan: plan.clone(),
            fingerprint,
            strategy: ExecutionStrategy::Serial,
            degree: 1,
            buffer_capacity: self.config.streaming.min_buffer_capacity,
            estimated_rows,
            cache_ttl: None,
            cached: None,
        };

        let cache = self.cache.as_ref().filter(|_| self.config.cache.enabled);
        if let Some(cache) = cache.filter(|_| !plan.unbounded) {
            optimized.cache_ttl = Some(self.config.cache.ttl);
            if !hints.bypass_cache {
                if let Some(rows) = cache.get(fingerprint) {
                    optimized.strategy = ExecutionStrategy::Cached;
                    optimized.cached = Some(rows);
                    return Ok(self.selected(optimized));
                }
            }
        }

        if plan.unbounded {
            optimized.strategy = ExecutionStrategy::Streaming;
            optimized.buffer_capacity = self.buffer_capacity();
            return Ok(self.selected(optimized));
        }

        let heavy = plan.has_join_or_aggregate();
        let large = estimated_rows > self.config.parallel_row_threshold;
        let wanted = match (heavy, large, self.config.adaptive) {
            (true, true, _) => ExecutionStrategy::Parallel,
            (true, false, true) => ExecutionStrategy::Adaptive,
            _ => ExecutionStrategy::Serial,
        };
        if wanted == ExecutionStrategy::Serial {
            return Ok(self.selected(optimized));
        }

        let workers = hints.available_workers.unwrap_or_else(hardware_concurrency);
        if workers == 0 {
            warn!(
                fingerprint,
                from = %wanted,
                to = %ExecutionStrategy::Serial,
                "exec.bridge.downgrade"
            );
            return Ok(self.selected(optimized));
        }
        let ceiling = workers.min(self.config.max_parallelism).max(1);
        optimized.strategy = wanted;
        optimized.degree = match wanted {
            ExecutionStrategy::Parallel => {
                let fan_out = estimated_rows / self.config.min_rows_per_partition;
                ceiling.min(usize::try_from(fan_out).unwrap_or(usize::MAX)).max(1)
            }
            // Adaptive sizes against observed rows when it switches.
            _ => ceiling,
        };
        Ok(self.selected(optimized))
    }

    fn buffer_capacity(&self) -> usize {
        let streaming = &self.config.streaming;
        let sized = streaming.latency_budget.as_secs_f64() * streaming.expected_events_per_sec as f64;
        (sized.ceil() as usize).max(streaming.min_buffer_capacity)
    }

    fn selected(&self, optimized: OptimizedPlan) -> OptimizedPlan {
        info!(
            fingerprint = optimized.fingerprint,
            strategy = %optimized.strategy,
            degree = optimized.degree,
            estimated_rows = optimized.estimated_rows,
            "exec.bridge.selected"
        );
        optimized
    }
}

fn hardware_concurrency() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
