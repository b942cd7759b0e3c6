//! Hash join kernels shared by the serial and parallel engines.

use rustc_hash::FxHashMap;

use crate::types::{Row, Value};

/// Which input of the join the build table was created from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildSide {
    /// Build rows come from the left input.
    Left,
    /// Build rows come from the right input.
    Right,
}

/// In-memory hash table over the build input.
#[derive(Debug, Default)]
pub struct JoinTable {
    buckets: FxHashMap<Value, Vec<Row>>,
    rows: usize,
}

impl JoinTable {
    /// Builds a table keyed on `key`. Rows with a null or missing key are
    /// dropped since they can never match.
    pub fn build<'a>(rows: impl IntoIterator<Item = &'a Row>, key: &str) -> Self {
        let mut table = JoinTable::default();
        for row in rows {
            table.insert(row.clone(), key);
        }
        table
    }

    /// Adds one build row.
    pub fn insert(&mut self, row: Row, key: &str) {
        match row.get(key) {
            None | Some(Value::Null) => {}
            Some(k) => {
                let k = k.clone();
                self.buckets.entry(k).or_default().push(row);
                self.rows += 1;
            }
        }
    }

    /// Number of build rows held.
    pub fn len(&self) -> usize {
        self.rows
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Emits one joined row per build match of `probe`.
    pub fn probe(&self, probe: &Row, probe_key: &str, build_side: BuildSide, out: &mut Vec<Row>) {
        let Some(key) = probe.get(probe_key).filter(|k| !k.is_null()) else {
            return;
        };
        let Some(matches) = self.buckets.get(key) else {
            return;
        };
        for build in matches {
            let joined = match build_side {
                BuildSide::Left => join_rows(build, probe),
                BuildSide::Right => join_rows(probe, build),
            };
            out.push(joined);
        }
    }
}

/// Concatenates a left and right row. A right column whose name is already
/// taken by a different left value is renamed `right.<name>`.
pub fn join_rows(left: &Row, right: &Row) -> Row {
    let mut out = left.clone();
    for (name, value) in right {
        match out.get(name) {
            None => {
                out.insert(name.clone(), value.clone());
            }
            Some(existing) if existing == value => {}
            Some(_) => {
                out.insert(format!("right.{name}"), value.clone());
            }
        }
    }
    out
}
