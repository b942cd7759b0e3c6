//! Storage boundary: leaf scan implementations live in the storage engines.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use super::AccessPath;
use crate::ops::eval_predicate;
use crate::types::{ExecError, OperatorId, Result, Row};

/// Positional, replayable row source provided by a storage engine.
///
/// Positions are stable for the duration of a query, so a task can resume
/// a scan from a checkpointed offset.
pub trait ScanSource: Send + Sync {
    /// Total number of addressable positions.
    fn row_count(&self) -> u64;

    /// Returns the rows stored at positions `range`, applying the access
    /// path predicate when one is supplied.
    fn scan(&self, range: Range<u64>, access: Option<&AccessPath>) -> Result<Vec<Row>>;
}

/// In-memory table, used for tests and for small materialized inputs.
#[derive(Debug, Default, Clone)]
pub struct MemTable {
    rows: Arc<Vec<Row>>,
}

impl MemTable {
    /// Wraps the given rows.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Arc::new(rows),
        }
    }
}

impl ScanSource for MemTable {
    fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    fn scan(&self, range: Range<u64>, access: Option<&AccessPath>) -> Result<Vec<Row>> {
        let len = self.rows.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.clamp(range.start.min(len), len) as usize;
        let slice = &self.rows[start..end];
        let predicate = access.and_then(|a| a.predicate.as_ref());
        Ok(match predicate {
            Some(pred) => slice
                .iter()
                .filter(|row| eval_predicate(pred, row))
                .cloned()
                .collect(),
            None => slice.to_vec(),
        })
    }
}

/// Catalog of scan sources keyed by table name.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    tables: Arc<RwLock<HashMap<String, Arc<dyn ScanSource>>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a table.
    pub fn register(&self, table: impl Into<String>, source: Arc<dyn ScanSource>) {
        self.tables.write().insert(table.into(), source);
    }

    /// Looks up a table for the given operator.
    pub fn resolve(&self, operator: &OperatorId, table: &str) -> Result<Arc<dyn ScanSource>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| ExecError::fatal(operator, format!("unknown table '{table}'")))
    }
}
