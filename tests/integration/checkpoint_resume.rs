mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{collect, init_tracing, numbered, scan, shared, sorted, FlakySource};
use lakeflow::config::RetryPolicy;
use lakeflow::fault::{CheckpointRecord, SnapshotBody};
use lakeflow::plan::{AggFunc, AggregateExpr};
use lakeflow::{
    CheckpointStore, ErrorKind, ExecConfig, ExecError, ExecutionStatus, FileCheckpointStore,
    OperatorId, Plan, PlanNode, PlanOp, QueryExecutor, QueryId, Result, Row, RuntimeHints,
    SourceRegistry,
};

const ROWS: i64 = 300;

fn config() -> ExecConfig {
    ExecConfig::default()
        .parallel_row_threshold(u64::MAX)
        .batch_size(10)
        .checkpoint_every(100, Duration::from_secs(3_600))
        .retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        })
}

fn totals_by_group() -> Plan {
    let agg = PlanNode::with_inputs(
        "agg",
        PlanOp::Aggregate {
            group_by: vec!["g".into()],
            aggregates: vec![
                AggregateExpr::count_all("n"),
                AggregateExpr::new(AggFunc::Sum, "v", "total"),
            ],
        },
        vec![scan("scan", "facts", ROWS as u64)],
    );
    Plan::new(agg)
}

fn healthy_result() -> Result<Vec<Row>> {
    let sources = SourceRegistry::new();
    sources.register("facts", Arc::new(lakeflow::MemTable::new(numbered(ROWS, 7))));
    let executor = QueryExecutor::new(config(), sources).with_result_cache(None);
    let (rows, status) = collect(&executor.submit(totals_by_group())?)?;
    assert_eq!(status, ExecutionStatus::Completed);
    Ok(sorted(rows))
}

fn executor_over(source: Arc<FlakySource>, config: ExecConfig) -> QueryExecutor {
    let sources = SourceRegistry::new();
    sources.register("facts", source);
    QueryExecutor::new(config, sources).with_result_cache(None)
}

#[test]
fn transient_failure_replays_from_latest_checkpoint() -> Result<()> {
    init_tracing();
    let source = shared(FlakySource::new(numbered(ROWS, 7), 150, 1, true));
    let executor = executor_over(Arc::clone(&source), config());

    let handle = executor.submit(totals_by_group())?;
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), healthy_result()?);
    assert_eq!(source.failures_left(), 0);

    let stats = handle.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.rows_replayed, 50);
    assert!(stats.checkpoints_written >= 2);
    assert_eq!(handle.progress().rows_processed, ROWS as u64);
    Ok(())
}

#[test]
fn failed_query_resumes_under_the_same_id() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(dir.path())?);
    let source = shared(FlakySource::new(numbered(ROWS, 7), 200, 1, false));
    let executor =
        executor_over(Arc::clone(&source), config()).with_checkpoint_store(Arc::clone(&store));
    let query_id = QueryId::from("nightly-rollup");

    let first =
        executor.submit_with_id(query_id.clone(), totals_by_group(), RuntimeHints::default())?;
    let (_, status) = collect(&first)?;
    assert!(matches!(
        status,
        ExecutionStatus::Failed {
            kind: ErrorKind::FatalOperator,
            ..
        }
    ));
    let kept = store.read_latest(&query_id, &OperatorId::from("agg"))?;
    assert!(matches!(
        kept.map(|record| record.snapshot.body),
        Some(SnapshotBody::Aggregate { position: 200, .. })
    ));

    let second = executor.submit_with_id(query_id.clone(), totals_by_group(), RuntimeHints::default())?;
    let (rows, status) = collect(&second)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(second.stats().operators_resumed, 1);
    assert_eq!(sorted(rows), healthy_result()?);

    // A completed run leaves nothing behind to resume from.
    assert!(store.read_latest(&query_id, &OperatorId::from("agg"))?.is_none());
    Ok(())
}

#[test]
fn recovery_handler_runs_once_retries_are_exhausted() -> Result<()> {
    init_tracing();
    let source = shared(FlakySource::new(numbered(ROWS, 7), 150, u32::MAX, true));
    let calls = Arc::new(AtomicU32::new(0));
    let config = config().retry(RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    });

    let healer = Arc::clone(&source);
    let counter = Arc::clone(&calls);
    let executor = executor_over(Arc::clone(&source), config).with_recovery_handler(
        move |operator: &OperatorId, error: &ExecError| -> Result<()> {
            assert_eq!(operator.as_str(), "agg");
            assert!(error.is_transient());
            counter.fetch_add(1, Ordering::SeqCst);
            healer.heal();
            Ok(())
        },
    );

    let handle = executor.submit(totals_by_group())?;
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), healthy_result()?);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = handle.stats();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.retries, 1);
    Ok(())
}

#[test]
fn exhausted_retries_without_handler_fail_the_query() -> Result<()> {
    init_tracing();
    let source = shared(FlakySource::new(numbered(ROWS, 7), 150, u32::MAX, true));
    let executor = executor_over(source, config());

    let handle = executor.submit(totals_by_group())?;
    let (rows, status) = collect(&handle)?;
    assert!(rows.is_empty());
    match status {
        ExecutionStatus::Failed {
            operator_id,
            kind,
            message,
        } => {
            assert_eq!(operator_id, Some(OperatorId::from("agg")));
            assert_eq!(kind, ErrorKind::FatalOperator);
            assert!(message.contains("retry budget of 3 attempts exhausted"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(handle.stats().retries, 3);
    Ok(())
}

/// Store whose writes always fail.
struct BrokenStore {
    writes: AtomicU32,
}

impl CheckpointStore for BrokenStore {
    fn write(&self, _record: &CheckpointRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(ExecError::checkpoint("store", "disk full"))
    }

    fn read_latest(&self, _query: &QueryId, _operator: &OperatorId) -> Result<Option<CheckpointRecord>> {
        Ok(None)
    }

    fn clear_operator(&self, _query: &QueryId, _operator: &OperatorId) -> Result<()> {
        Ok(())
    }

    fn clear_query(&self, _query: &QueryId) -> Result<()> {
        Ok(())
    }
}

#[test]
fn checkpoint_write_failures_do_not_fail_the_query() -> Result<()> {
    init_tracing();
    let store = Arc::new(BrokenStore {
        writes: AtomicU32::new(0),
    });
    let source = shared(FlakySource::new(numbered(ROWS, 7), 0, 0, true));
    let executor = executor_over(source, config()).with_checkpoint_store(store.clone());

    let handle = executor.submit(totals_by_group())?;
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), healthy_result()?);
    let stats = handle.stats();
    assert_eq!(stats.checkpoints_written, 0);
    assert!(stats.checkpoints_failed > 0);
    assert_eq!(u64::from(store.writes.load(Ordering::SeqCst)), stats.checkpoints_failed);
    Ok(())
}

#[test]
fn transient_failure_after_a_lost_checkpoint_restarts_from_zero() -> Result<()> {
    init_tracing();
    let store = Arc::new(BrokenStore {
        writes: AtomicU32::new(0),
    });
    let source = shared(FlakySource::new(numbered(ROWS, 7), 250, 1, true));
    let executor = executor_over(Arc::clone(&source), config()).with_checkpoint_store(store);

    let handle = executor.submit(totals_by_group())?;
    let (rows, status) = collect(&handle)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(sorted(rows), healthy_result()?);
    let stats = handle.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.rows_replayed, 250);
    // Replayed rows are not counted twice.
    assert_eq!(handle.progress().rows_processed, ROWS as u64);
    Ok(())
}
