#![forbid(unsafe_code)]

//! Resource configuration for the execution core.
//!
//! Every option group has a usable default. [`ExecConfig::validate`] runs at
//! submission; a failure there is fatal and no execution starts.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{ExecError, Result};

/// Checkpoint retention policy for stores that keep history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Only the newest record per operator survives.
    KeepLatest,
    /// The newest `n` records per operator survive.
    KeepLastN(usize),
}

/// When operator state is snapshotted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointOptions {
    /// Snapshot after this many input rows.
    pub every_rows: u64,
    /// Snapshot after this much wall time, whichever comes first.
    #[serde(with = "millis")]
    pub every: Duration,
    /// History kept per operator.
    pub retention: Retention,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            every_rows: 10_000,
            every: Duration::from_secs(5),
            retention: Retention::KeepLatest,
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed per operator before the recovery handler runs.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Sliding-window failure detection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailureDetectorOptions {
    /// Length of the sliding window.
    #[serde(with = "millis")]
    pub window: Duration,
    /// Consecutive failures inside the window that mark an operator failed.
    pub threshold: u32,
}

impl Default for FailureDetectorOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 10,
        }
    }
}

/// Streaming engine sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingOptions {
    /// End-to-end latency target; drives buffer sizing.
    #[serde(with = "millis")]
    pub latency_budget: Duration,
    /// Expected event rate used to size buffers from the latency budget.
    pub expected_events_per_sec: u64,
    /// Lower bound on any stream buffer's capacity.
    pub min_buffer_capacity: usize,
    /// Checkpoint streaming state after this many events.
    pub checkpoint_every_events: u64,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            latency_budget: Duration::from_millis(500),
            expected_events_per_sec: 10_000,
            min_buffer_capacity: 1_024,
            checkpoint_every_events: 10_000,
        }
    }
}

/// Progress handler cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressOptions {
    /// Notify handlers every this many rows.
    pub every_rows: u64,
    /// Notify handlers at least this often while rows flow.
    #[serde(with = "millis")]
    pub every: Duration,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            every_rows: 1_000,
            every: Duration::from_millis(250),
        }
    }
}

/// Result cache policy for the CACHED strategy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Whether cached results are consulted and written through.
    pub enabled: bool,
    /// Validity of a cached result.
    #[serde(with = "millis")]
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Upper bound on the parallelism degree.
    pub max_parallelism: usize,
    /// Estimated input rows above which joins/aggregations run in parallel.
    pub parallel_row_threshold: u64,
    /// Rows a single partition should carry at minimum; bounds fan-out.
    pub min_rows_per_partition: u64,
    /// Rows read per operator step.
    pub batch_size: usize,
    /// Capacity of each per-partition channel, in batches.
    pub channel_capacity: usize,
    /// Size of the I/O worker pool; zero means "same as the degree".
    pub io_pool_size: usize,
    /// Whether plans below the threshold may switch to parallel at runtime.
    pub adaptive: bool,
    /// Bound on worker pool teardown.
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
    /// Checkpoint cadence and retention.
    pub checkpoint: CheckpointOptions,
    /// Retry policy for transient operator failures.
    pub retry: RetryPolicy,
    /// Failure detector settings.
    pub detector: FailureDetectorOptions,
    /// Streaming sizing.
    pub streaming: StreamingOptions,
    /// Progress cadence.
    pub progress: ProgressOptions,
    /// Result cache policy.
    pub cache: CacheOptions,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            parallel_row_threshold: 100_000,
            min_rows_per_partition: 1_000,
            batch_size: 1_024,
            channel_capacity: 16,
            io_pool_size: 0,
            adaptive: false,
            shutdown_timeout: Duration::from_secs(5),
            checkpoint: CheckpointOptions::default(),
            retry: RetryPolicy::default(),
            detector: FailureDetectorOptions::default(),
            streaming: StreamingOptions::default(),
            progress: ProgressOptions::default(),
            cache: CacheOptions::default(),
        }
    }
}

impl ExecConfig {
    /// Parses a TOML document; omitted keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|err| ExecError::config(format!("failed to parse config: {err}")))
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            ExecError::config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Sets the maximum parallelism degree.
    pub fn max_parallelism(mut self, degree: usize) -> Self {
        self.max_parallelism = degree;
        self
    }

    /// Sets the row threshold for the parallel strategy.
    pub fn parallel_row_threshold(mut self, rows: u64) -> Self {
        self.parallel_row_threshold = rows;
        self
    }

    /// Sets the minimum rows per partition.
    pub fn min_rows_per_partition(mut self, rows: u64) -> Self {
        self.min_rows_per_partition = rows;
        self
    }

    /// Sets the operator batch size.
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows;
        self
    }

    /// Enables or disables adaptive execution.
    pub fn adaptive(mut self, enabled: bool) -> Self {
        self.adaptive = enabled;
        self
    }

    /// Sets the checkpoint cadence.
    pub fn checkpoint_every(mut self, rows: u64, every: Duration) -> Self {
        self.checkpoint.every_rows = rows;
        self.checkpoint.every = every;
        self
    }

    /// Replaces the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Replaces the cache policy.
    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the progress cadence.
    pub fn progress(mut self, progress: ProgressOptions) -> Self {
        self.progress = progress;
        self
    }

    /// Checks resource settings; errors are fatal at submission.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ExecError::config(msg));
        if self.max_parallelism == 0 {
            return fail("max_parallelism must be at least 1");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.channel_capacity == 0 {
            return fail("channel_capacity must be at least 1");
        }
        if self.min_rows_per_partition == 0 {
            return fail("min_rows_per_partition must be at least 1");
        }
        if self.shutdown_timeout.is_zero() {
            return fail("shutdown_timeout must be non-zero");
        }
        if self.checkpoint.every_rows == 0 {
            return fail("checkpoint.every_rows must be at least 1");
        }
        if matches!(self.checkpoint.retention, Retention::KeepLastN(0)) {
            return fail("checkpoint.retention must keep at least one record");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return fail("retry.multiplier must be >= 1.0");
        }
        if self.detector.threshold == 0 {
            return fail("detector.threshold must be at least 1");
        }
        if self.detector.window.is_zero() {
            return fail("detector.window must be non-zero");
        }
        if self.streaming.latency_budget.is_zero() {
            return fail("streaming.latency_budget must be non-zero");
        }
        if self.streaming.min_buffer_capacity == 0 {
            return fail("streaming.min_buffer_capacity must be at least 1");
        }
        if self.streaming.checkpoint_every_events == 0 {
            return fail("streaming.checkpoint_every_events must be at least 1");
        }
        if self.progress.every_rows == 0 {
            return fail("progress.every_rows must be at least 1");
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
