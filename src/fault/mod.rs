#![forbid(unsafe_code)]

//! Fault tolerance for operator execution.
//!
//! Operators run as [`Resumable`] tasks inside a [`FaultTolerantShell`]. The
//! shell snapshots a task every N rows or T elapsed time (whichever comes
//! first) into a [`CheckpointStore`], retries transient failures with
//! exponential backoff from the latest checkpoint, and hands an operator
//! whose retry budget is spent to an optional [`RecoveryHandler`].
//!
//! Checkpoint writes are best-effort. Reads during a retry fall back to a
//! full restart of the operator; reads after a recovery handler ran are
//! authoritative and fail the query.

mod checkpoint;
mod detector;
mod shell;

pub use checkpoint::{
    CheckpointRecord, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    OperatorSnapshot, SnapshotBody, SNAPSHOT_VERSION,
};
pub use detector::{FailureDetector, FailureRecord, FailureVerdict};
pub use shell::{FaultTolerantShell, OperatorState, RecoveryHandler, Resumable, StepOutcome};
