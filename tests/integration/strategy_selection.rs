mod common;

use std::ops::Range;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::{collect, init_tracing, numbered, scan, sorted};
use lakeflow::config::ProgressOptions;
use lakeflow::plan::{AccessPath, AggFunc, AggregateExpr};
use lakeflow::{
    ErrorKind, ExecConfig, ExecError, ExecutionStatus, ExecutionStrategy, MemTable, Plan,
    PlanNode, PlanOp, ProgressState, QueryExecutor, Result, Row, RuntimeHints, ScanSource,
    SourceRegistry,
};
use parking_lot::Mutex;

/// Table whose first read blocks until the gate is opened or dropped.
struct GatedSource {
    inner: MemTable,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedSource {
    fn new(rows: Vec<Row>) -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let source = Arc::new(Self {
            inner: MemTable::new(rows),
            gate: Mutex::new(Some(rx)),
        });
        (source, tx)
    }
}

impl ScanSource for GatedSource {
    fn row_count(&self) -> u64 {
        self.inner.row_count()
    }

    fn scan(&self, range: Range<u64>, access: Option<&AccessPath>) -> Result<Vec<Row>> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.scan(range, access)
    }
}

fn sum_by_group(estimated: u64) -> Plan {
    Plan::new(PlanNode::with_inputs(
        "agg",
        PlanOp::Aggregate {
            group_by: vec!["g".into()],
            aggregates: vec![
                AggregateExpr::count_all("n"),
                AggregateExpr::new(AggFunc::Sum, "v", "total"),
            ],
        },
        vec![scan("scan", "facts", estimated)],
    ))
}

fn facts(rows: i64) -> SourceRegistry {
    let sources = SourceRegistry::new();
    sources.register("facts", Arc::new(MemTable::new(numbered(rows, 9))));
    sources
}

fn serial_result(sources: &SourceRegistry, plan: Plan) -> Result<Vec<Row>> {
    let executor = QueryExecutor::new(ExecConfig::default(), sources.clone()).with_result_cache(None);
    let (rows, status) = collect(&executor.submit(plan)?)?;
    assert_eq!(status, ExecutionStatus::Completed);
    Ok(sorted(rows))
}

#[test]
fn repeated_plan_is_served_from_the_cache() -> Result<()> {
    init_tracing();
    let executor = QueryExecutor::new(ExecConfig::default(), facts(500));

    let first = executor.submit(sum_by_group(500))?;
    assert_eq!(first.strategy(), ExecutionStrategy::Serial);
    let (fresh, status) = collect(&first)?;
    assert_eq!(status, ExecutionStatus::Completed);

    let second = executor.submit(sum_by_group(500))?;
    assert_eq!(second.strategy(), ExecutionStrategy::Cached);
    let (cached, status) = collect(&second)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(cached, fresh);
    assert_eq!(second.progress().state, ProgressState::Completed);

    let refresh = executor.submit_with(
        sum_by_group(500),
        RuntimeHints {
            bypass_cache: true,
            ..RuntimeHints::default()
        },
    )?;
    assert_eq!(refresh.strategy(), ExecutionStrategy::Serial);
    let (rows, _) = collect(&refresh)?;
    assert_eq!(sorted(rows), sorted(fresh));
    Ok(())
}

#[test]
fn adaptive_switches_to_parallel_on_observed_volume() -> Result<()> {
    init_tracing();
    let sources = facts(5_000);
    let config = ExecConfig::default()
        .adaptive(true)
        .parallel_row_threshold(1_000);
    let executor = QueryExecutor::new(config, sources.clone()).with_result_cache(None);

    // The estimate says tiny; the table says otherwise.
    let handle = executor.submit_with(sum_by_group(10), RuntimeHints::with_workers(4))?;
    assert_eq!(handle.strategy(), ExecutionStrategy::Adaptive);
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), serial_result(&sources, sum_by_group(10))?);

    let stats = handle.stats();
    assert_eq!(stats.strategy_switches, 1);
    assert_eq!(stats.partitions, 4);
    Ok(())
}

#[test]
fn adaptive_stays_serial_below_the_threshold() -> Result<()> {
    init_tracing();
    let sources = facts(200);
    let config = ExecConfig::default()
        .adaptive(true)
        .parallel_row_threshold(1_000);
    let executor = QueryExecutor::new(config, sources.clone()).with_result_cache(None);

    let handle = executor.submit_with(sum_by_group(200), RuntimeHints::with_workers(4))?;
    assert_eq!(handle.strategy(), ExecutionStrategy::Adaptive);
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), serial_result(&sources, sum_by_group(200))?);
    assert_eq!(handle.stats().strategy_switches, 0);
    assert_eq!(handle.stats().partitions, 0);
    Ok(())
}

#[test]
fn no_workers_downgrades_to_serial() -> Result<()> {
    init_tracing();
    let sources = facts(3_000);
    let config = ExecConfig::default().parallel_row_threshold(0);
    let executor = QueryExecutor::new(config, sources.clone()).with_result_cache(None);

    let handle = executor.submit_with(sum_by_group(3_000), RuntimeHints::with_workers(0))?;
    assert_eq!(handle.strategy(), ExecutionStrategy::Serial);
    assert_eq!(handle.degree(), 1);
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), serial_result(&sources, sum_by_group(3_000))?);
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_at_submit() {
    init_tracing();
    let executor = QueryExecutor::new(ExecConfig::default().batch_size(0), facts(10));
    match executor.submit(sum_by_group(10)) {
        Err(err) => {
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(matches!(err, ExecError::Configuration(_)));
        }
        Ok(handle) => panic!("submitted {}", handle.query_id()),
    }
}

#[test]
fn results_can_be_taken_once() -> Result<()> {
    init_tracing();
    let executor = QueryExecutor::new(ExecConfig::default(), facts(100));
    let handle = executor.submit(Plan::new(scan("scan", "facts", 100)))?;

    let rows: Vec<Row> = handle.results()?.collect();
    assert_eq!(rows.len(), 100);
    assert!(matches!(handle.results(), Err(ExecError::Configuration(_))));
    assert_eq!(handle.wait(), ExecutionStatus::Completed);
    assert_eq!(handle.stats().rows_emitted, 100);
    Ok(())
}

#[test]
fn progress_is_monotonic_and_ends_at_one_hundred() -> Result<()> {
    init_tracing();
    let (source, gate) = GatedSource::new(numbered(5_000, 5));
    let sources = SourceRegistry::new();
    sources.register("facts", source);
    let config = ExecConfig::default().batch_size(100).progress(ProgressOptions {
        every_rows: 500,
        every: Duration::from_secs(3_600),
    });
    let executor = QueryExecutor::new(config, sources).with_result_cache(None);

    let handle = executor.submit(Plan::new(scan("scan", "facts", 5_000)))?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle.on_progress(move |snapshot| sink.lock().push((snapshot.percent, snapshot.state)));
    gate.send(()).ok();

    let (rows, status) = collect(&handle)?;
    assert_eq!(rows.len(), 5_000);
    assert_eq!(status, ExecutionStatus::Completed);

    let seen = seen.lock();
    assert!(seen.len() >= 2);
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(seen.last(), Some(&(100.0, ProgressState::Completed)));
    let progress = handle.progress();
    assert_eq!(progress.rows_processed, 5_000);
    assert_eq!(progress.estimated_remaining, Some(Duration::ZERO));
    Ok(())
}

#[test]
fn cancelling_a_finite_query() -> Result<()> {
    init_tracing();
    let (source, gate) = GatedSource::new(numbered(2_000, 5));
    let sources = SourceRegistry::new();
    sources.register("facts", source);
    let executor = QueryExecutor::new(ExecConfig::default().batch_size(100), sources);

    let handle = executor.submit(sum_by_group(2_000))?;
    assert_eq!(handle.wait_timeout(Duration::from_millis(20)), None);
    assert_eq!(handle.status(), ExecutionStatus::Running);

    handle.cancel();
    drop(gate);
    assert_eq!(handle.wait(), ExecutionStatus::Cancelled);
    assert_eq!(handle.progress().state, ProgressState::Cancelled);
    assert!(matches!(handle.results(), Err(ExecError::Configuration(_))));
    Ok(())
}
