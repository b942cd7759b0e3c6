//! Execution core of a multi-modal data-lake query engine.
//!
//! Given an optimized, index-annotated [`Plan`], the core decides how to run
//! it (serially, partitioned across worker pools, as a continuous stream,
//! from the result cache, or adaptively) and survives operator failures by
//! checkpointing and resuming operator state.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lakeflow::{ExecConfig, MemTable, Plan, PlanNode, PlanOp, QueryExecutor, SourceRegistry};
//!
//! # fn main() -> lakeflow::Result<()> {
//! let sources = SourceRegistry::new();
//! sources.register("events", Arc::new(MemTable::new(Vec::new())));
//! let executor = QueryExecutor::new(ExecConfig::default(), sources);
//! let scan = PlanNode::new("scan", PlanOp::Scan { table: "events".into() });
//! let handle = executor.submit(Plan::new(scan))?;
//! let rows: Vec<_> = handle.results()?.collect();
//! println!("{} rows, {}", rows.len(), handle.wait());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod exec;
pub mod fault;
pub mod ops;
pub mod parallel;
pub mod plan;
pub mod progress;
pub mod streaming;
pub mod types;

pub use bridge::{
    ExecutionStrategy, LruResultCache, OptimizedPlan, ResultCache, RuntimeHints, StrategyBridge,
};
pub use config::ExecConfig;
pub use exec::{
    CancellationToken, ExecutionHandle, ExecutionStatus, QueryExecutor, ResultStream,
    StatsSnapshot,
};
pub use fault::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RecoveryHandler};
pub use plan::{MemTable, Plan, PlanNode, PlanOp, ScanSource, SourceRegistry};
pub use progress::{ProgressSnapshot, ProgressState};
pub use streaming::{StreamMatch, StreamRegistry, StreamSender};
pub use types::{ErrorKind, ExecError, OperatorId, QueryId, Result, Row, Value};
