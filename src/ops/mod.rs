#![forbid(unsafe_code)]

//! Operator kernels shared by every execution strategy.
//!
//! Kernels are pure functions over rows (predicates, projection, sorting,
//! join tables, aggregate states). [`RowsTask`] and [`AggregateTask`] wrap
//! them into resumable tasks that the fault-tolerant shell can checkpoint.

mod aggregate;
mod input;
mod join;
mod predicate;
mod task;

pub use aggregate::{AggState, GroupSnapshot, GroupTable};
pub use input::{RowInput, RowTransform};
pub use join::{join_rows, BuildSide, JoinTable};
pub use predicate::{eval_predicate, project, sort_rows};
pub use task::{AggregateTask, RowSink, RowsTask};
