//! Replayable operator inputs and per-row transforms.

use std::ops::Range;
use std::sync::Arc;

use crate::ops::join::{BuildSide, JoinTable};
use crate::ops::predicate::{eval_predicate, project};
use crate::plan::{AccessPath, Predicate, ScanSource};
use crate::types::{Result, Row};

/// Positional input of an operator task. Reads are repeatable, which is
/// what lets a task resume from a checkpointed position.
#[derive(Clone)]
pub enum RowInput {
    /// Rows read from a storage leaf.
    Source {
        /// Storage implementation.
        source: Arc<dyn ScanSource>,
        /// Positions owned by this input.
        range: Range<u64>,
        /// Index access path forwarded to storage.
        access: Option<AccessPath>,
    },
    /// A slice of rows materialized by an upstream operator.
    Rows {
        /// Shared materialized rows.
        rows: Arc<Vec<Row>>,
        /// Slice owned by this input.
        range: Range<usize>,
    },
}

impl RowInput {
    /// Input covering every position of `source`.
    pub fn source(source: Arc<dyn ScanSource>, access: Option<AccessPath>) -> Self {
        let range = 0..source.row_count();
        RowInput::Source {
            source,
            range,
            access,
        }
    }

    /// Input covering all of `rows`.
    pub fn rows(rows: Vec<Row>) -> Self {
        let len = rows.len();
        RowInput::Rows {
            rows: Arc::new(rows),
            range: 0..len,
        }
    }

    /// Number of positions in this input.
    pub fn len(&self) -> u64 {
        match self {
            RowInput::Source { range, .. } => range.end.saturating_sub(range.start),
            RowInput::Rows { range, .. } => range.len() as u64,
        }
    }

    /// Whether the input has no positions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether rows come straight from storage.
    pub fn is_source(&self) -> bool {
        matches!(self, RowInput::Source { .. })
    }

    /// Reads up to `limit` positions starting at relative `offset`.
    pub fn read(&self, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let end = offset.saturating_add(limit).min(self.len());
        if offset >= end {
            return Ok(Vec::new());
        }
        match self {
            RowInput::Source {
                source,
                range,
                access,
            } => source.scan(range.start + offset..range.start + end, access.as_ref()),
            RowInput::Rows { rows, range } => {
                let start = range.start + offset as usize;
                let stop = range.start + end as usize;
                Ok(rows[start..stop].to_vec())
            }
        }
    }

    /// Sub-input covering relative positions `sub`.
    pub fn slice(&self, sub: Range<u64>) -> RowInput {
        let len = self.len();
        let (lo, hi) = (sub.start.min(len), sub.end.min(len));
        match self {
            RowInput::Source {
                source,
                range,
                access,
            } => RowInput::Source {
                source: Arc::clone(source),
                range: range.start + lo..range.start + hi,
                access: access.clone(),
            },
            RowInput::Rows { rows, range } => RowInput::Rows {
                rows: Arc::clone(rows),
                range: range.start + lo as usize..range.start + hi as usize,
            },
        }
    }
}

/// Stateless per-row transform fused into a task.
#[derive(Clone)]
pub enum RowTransform {
    /// Pass rows through.
    Identity,
    /// Keep rows matching the predicate.
    Filter(Predicate),
    /// Keep only the listed columns.
    Project(Vec<String>),
    /// Probe a join table built from the other input.
    Probe {
        /// Build-side hash table.
        table: Arc<JoinTable>,
        /// Join column on the probe side.
        probe_key: String,
        /// Input the table was built from.
        build_side: BuildSide,
    },
    /// Applies each stage to the output of the previous one.
    Chain(Vec<RowTransform>),
}

impl RowTransform {
    /// Composes `self` followed by `next`.
    pub fn then(self, next: RowTransform) -> RowTransform {
        match (self, next) {
            (RowTransform::Identity, next) => next,
            (current, RowTransform::Identity) => current,
            (RowTransform::Chain(mut stages), next) => {
                stages.push(next);
                RowTransform::Chain(stages)
            }
            (current, next) => RowTransform::Chain(vec![current, next]),
        }
    }

    /// Whether the transform passes rows through unchanged.
    pub fn is_identity(&self) -> bool {
        matches!(self, RowTransform::Identity)
    }

    /// Applies the transform to one row.
    pub fn apply(&self, row: Row, out: &mut Vec<Row>) {
        match self {
            RowTransform::Identity => out.push(row),
            RowTransform::Filter(pred) => {
                if eval_predicate(pred, &row) {
                    out.push(row);
                }
            }
            RowTransform::Project(columns) => out.push(project(&row, columns)),
            RowTransform::Probe {
                table,
                probe_key,
                build_side,
            } => table.probe(&row, probe_key, *build_side, out),
            RowTransform::Chain(stages) => {
                let mut current = vec![row];
                for stage in stages {
                    let mut next = Vec::with_capacity(current.len());
                    for row in current {
                        stage.apply(row, &mut next);
                    }
                    current = next;
                }
                out.extend(current);
            }
        }
    }
}
