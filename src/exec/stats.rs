//! Per-query execution counters, read back as a [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of a run's execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Rows delivered to the result stream.
    pub rows_emitted: u64,
    /// Partition tasks scheduled on worker pools.
    pub partitions: u64,
    /// Retries performed after transient failures.
    pub retries: u64,
    /// Recovery handler invocations.
    pub recoveries: u64,
    /// Checkpoints durably written.
    pub checkpoints_written: u64,
    /// Checkpoint writes that failed and were skipped.
    pub checkpoints_failed: u64,
    /// Input rows processed a second time after restoring a checkpoint.
    pub rows_replayed: u64,
    /// Operators that resumed from a checkpoint left by an earlier run.
    pub operators_resumed: u64,
    /// Stream events dropped because a buffer was full.
    pub stream_events_dropped: u64,
    /// Stream events dropped because their window had already closed.
    pub late_events_dropped: u64,
    /// Strategy switches performed by adaptive execution.
    pub strategy_switches: u64,
}

/// Shared, lock-free execution counters for one run.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    rows_emitted: AtomicU64,
    partitions: AtomicU64,
    retries: AtomicU64,
    recoveries: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoints_failed: AtomicU64,
    rows_replayed: AtomicU64,
    operators_resumed: AtomicU64,
    stream_events_dropped: AtomicU64,
    late_events_dropped: AtomicU64,
    strategy_switches: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl ExecutionStats {
    counter! {
        add_rows_emitted => rows_emitted,
        add_partitions => partitions,
        add_retries => retries,
        add_recoveries => recoveries,
        add_checkpoints_written => checkpoints_written,
        add_checkpoints_failed => checkpoints_failed,
        add_rows_replayed => rows_replayed,
        add_operators_resumed => operators_resumed,
        add_stream_events_dropped => stream_events_dropped,
        add_late_events_dropped => late_events_dropped,
        add_strategy_switches => strategy_switches,
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            partitions: self.partitions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            rows_replayed: self.rows_replayed.load(Ordering::Relaxed),
            operators_resumed: self.operators_resumed.load(Ordering::Relaxed),
            stream_events_dropped: self.stream_events_dropped.load(Ordering::Relaxed),
            late_events_dropped: self.late_events_dropped.load(Ordering::Relaxed),
            strategy_switches: self.strategy_switches.load(Ordering::Relaxed),
        }
    }
}
