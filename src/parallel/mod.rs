#![forbid(unsafe_code)]

//! Parallel execution across partitions and per-query worker pools.
//!
//! Input is split into P partitions, by position range for scans and by an
//! xxh64 key hash for joins and grouped aggregation. Each partition is owned
//! by one worker and runs as a resumable task in the fault-tolerant shell.
//! Results come back through one bounded channel per partition; order is
//! preserved within a partition only.

mod engine;
mod partition;
mod pool;

pub use engine::ParallelEngine;
pub use partition::{hash_partition, partition_of, range_partitions};
pub use pool::{PoolKind, TaskHandle, WorkerPool};
