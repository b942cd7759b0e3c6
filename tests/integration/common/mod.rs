#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use lakeflow::plan::AccessPath;
use lakeflow::{
    ExecError, ExecutionHandle, ExecutionStatus, MemTable, PlanNode, PlanOp, Result, Row,
    ScanSource, Value,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lakeflow=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// `n` rows with an id, a group column `g = id % groups` and a value.
pub fn numbered(n: i64, groups: i64) -> Vec<Row> {
    (0..n)
        .map(|i| {
            lakeflow::types::row([
                ("id", Value::Int(i)),
                ("g", Value::Int(i % groups)),
                ("v", Value::Int(i * 7 % 101)),
            ])
        })
        .collect()
}

pub fn scan(id: &str, table: &str, estimated: u64) -> PlanNode {
    PlanNode::new(id, PlanOp::Scan { table: table.into() }).estimated(estimated)
}

pub fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort();
    rows
}

/// Drains a handle's results and waits for its terminal status.
pub fn collect(handle: &ExecutionHandle) -> Result<(Vec<Row>, ExecutionStatus)> {
    let rows: Vec<Row> = handle.results()?.collect();
    Ok((rows, handle.wait()))
}

/// Table that fails reads covering `fail_at` a limited number of times.
pub struct FlakySource {
    inner: MemTable,
    len: u64,
    fail_at: u64,
    remaining: AtomicU32,
    transient: bool,
}

impl FlakySource {
    pub fn new(rows: Vec<Row>, fail_at: u64, failures: u32, transient: bool) -> Self {
        Self {
            len: rows.len() as u64,
            inner: MemTable::new(rows),
            fail_at,
            remaining: AtomicU32::new(failures),
            transient,
        }
    }

    pub fn failures_left(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn heal(&self) {
        self.remaining.store(0, Ordering::SeqCst);
    }
}

impl ScanSource for FlakySource {
    fn row_count(&self) -> u64 {
        self.len
    }

    fn scan(&self, range: Range<u64>, access: Option<&AccessPath>) -> Result<Vec<Row>> {
        if range.contains(&self.fail_at) {
            let took = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if took {
                return Err(if self.transient {
                    ExecError::transient("storage", "injected read failure")
                } else {
                    ExecError::fatal("storage", "injected corruption")
                });
            }
        }
        self.inner.scan(range, access)
    }
}

pub fn shared<S: ScanSource + 'static>(source: S) -> Arc<S> {
    Arc::new(source)
}
