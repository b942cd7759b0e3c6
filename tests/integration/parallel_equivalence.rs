mod common;

use std::sync::Arc;

use common::{collect, init_tracing, numbered, scan, sorted, FlakySource};
use lakeflow::config::FailureDetectorOptions;
use lakeflow::exec::ExecutionStats;
use lakeflow::fault::{FailureDetector, FaultTolerantShell};
use lakeflow::ops::{GroupTable, RowInput, RowTransform};
use lakeflow::parallel::ParallelEngine;
use lakeflow::plan::{AggFunc, AggregateExpr, CmpOp, Predicate, SortKey};
use lakeflow::progress::ProgressTracker;
use lakeflow::types::row;
use lakeflow::{
    CancellationToken, ErrorKind, ExecConfig, ExecutionStatus, ExecutionStrategy,
    InMemoryCheckpointStore, MemTable, Plan, PlanNode, PlanOp, QueryExecutor, Result, Row,
    RuntimeHints, ScanSource, SourceRegistry, Value,
};
use proptest::prelude::*;

fn executor(sources: &SourceRegistry, parallel: bool) -> QueryExecutor {
    let config = if parallel {
        ExecConfig::default()
            .parallel_row_threshold(0)
            .min_rows_per_partition(10)
            .batch_size(64)
    } else {
        ExecConfig::default()
            .parallel_row_threshold(u64::MAX)
            .batch_size(64)
    };
    QueryExecutor::new(config, sources.clone()).with_result_cache(None)
}

fn run_both(sources: &SourceRegistry, plan: Plan, degree: usize) -> Result<(Vec<Row>, Vec<Row>)> {
    let serial = executor(sources, false).submit(plan.clone())?;
    assert_eq!(serial.strategy(), ExecutionStrategy::Serial);
    let (serial_rows, status) = collect(&serial)?;
    assert_eq!(status, ExecutionStatus::Completed);

    let parallel = executor(sources, true).submit_with(plan, RuntimeHints::with_workers(degree))?;
    assert_eq!(parallel.strategy(), ExecutionStrategy::Parallel);
    assert_eq!(parallel.degree(), degree);
    let (parallel_rows, status) = collect(&parallel)?;
    assert_eq!(status, ExecutionStatus::Completed);
    assert!(parallel.stats().partitions >= degree as u64);
    Ok((serial_rows, parallel_rows))
}

#[test]
fn scan_is_split_into_near_equal_partitions() -> Result<()> {
    init_tracing();
    let config = ExecConfig::default().batch_size(256);
    let stats = Arc::new(ExecutionStats::default());
    let progress = Arc::new(ProgressTracker::new(10_000, config.progress.clone()));
    progress.start();
    let shell = FaultTolerantShell::new(
        "scenario-a".into(),
        Arc::new(InMemoryCheckpointStore::default()),
        config.checkpoint.clone(),
        config.retry.clone(),
        Arc::new(FailureDetector::new(&FailureDetectorOptions::default())),
        Arc::clone(&stats),
    )
    .with_progress(Arc::clone(&progress));
    let engine = ParallelEngine::new(4, &config, Arc::new(shell), CancellationToken::new())?;

    let source: Arc<dyn ScanSource> = Arc::new(MemTable::new(numbered(10_000, 10)));
    let rows = engine.scan(
        &"scan".into(),
        RowInput::source(source, None),
        RowTransform::Identity,
        None,
    )?;
    assert_eq!(rows.len(), 10_000);
    assert_eq!(stats.snapshot().partitions, 4);
    assert_eq!(progress.snapshot().rows_processed, 10_000);

    let mut ids: Vec<i64> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..10_000).collect::<Vec<_>>());
    assert!(engine.shutdown());
    Ok(())
}

#[test]
fn parallel_join_matches_serial_join() -> Result<()> {
    init_tracing();
    let sources = SourceRegistry::new();
    let small = (0..100i64).map(|i| row([("lid", i), ("k", i % 50)]));
    let large = (0..1_000i64).map(|i| row([("rid", i), ("rk", i % 200)]));
    sources.register("small", Arc::new(MemTable::new(small.collect())));
    sources.register("large", Arc::new(MemTable::new(large.collect())));

    let join = PlanNode::with_inputs(
        "join",
        PlanOp::HashJoin {
            left_key: "k".into(),
            right_key: "rk".into(),
        },
        vec![scan("s", "small", 100), scan("l", "large", 1_000)],
    );
    let (serial, parallel) = run_both(&sources, Plan::new(join), 2)?;
    assert_eq!(serial.len(), 500);
    assert_eq!(sorted(serial), sorted(parallel));
    Ok(())
}

#[test]
fn parallel_aggregation_matches_serial() -> Result<()> {
    init_tracing();
    let sources = SourceRegistry::new();
    sources.register("facts", Arc::new(MemTable::new(numbered(5_000, 17))));
    let filter = PlanNode::with_inputs(
        "f",
        PlanOp::Filter {
            predicate: Predicate::compare("v", CmpOp::Gt, 10i64),
        },
        vec![scan("scan", "facts", 5_000)],
    );
    let agg = PlanNode::with_inputs(
        "agg",
        PlanOp::Aggregate {
            group_by: vec!["g".into()],
            aggregates: vec![
                AggregateExpr::count_all("n"),
                AggregateExpr::new(AggFunc::Sum, "v", "total"),
                AggregateExpr::new(AggFunc::Min, "v", "lo"),
                AggregateExpr::new(AggFunc::Max, "v", "hi"),
                AggregateExpr::new(AggFunc::Avg, "v", "mean"),
            ],
        },
        vec![filter],
    );
    let (serial, parallel) = run_both(&sources, Plan::new(agg), 4)?;
    assert_eq!(serial.len(), 17);
    assert_eq!(sorted(serial), sorted(parallel));
    Ok(())
}

#[test]
fn sort_and_limit_apply_after_the_merge() -> Result<()> {
    init_tracing();
    let sources = SourceRegistry::new();
    sources.register("facts", Arc::new(MemTable::new(numbered(2_000, 40))));
    let agg = PlanNode::with_inputs(
        "agg",
        PlanOp::Aggregate {
            group_by: vec!["g".into()],
            aggregates: vec![AggregateExpr::new(AggFunc::Sum, "v", "total")],
        },
        vec![scan("scan", "facts", 2_000)],
    );
    let sort = PlanNode::with_inputs(
        "sort",
        PlanOp::Sort {
            keys: vec![SortKey::desc("total"), SortKey::asc("g")],
        },
        vec![agg],
    );
    let limit = PlanNode::with_inputs("top", PlanOp::Limit { count: 5 }, vec![sort]);
    let (serial, parallel) = run_both(&sources, Plan::new(limit), 3)?;
    assert_eq!(serial.len(), 5);
    // Ordered output is identical, not just the multiset.
    assert_eq!(serial, parallel);
    Ok(())
}

#[test]
fn first_fatal_partition_error_fails_the_query() -> Result<()> {
    init_tracing();
    let sources = SourceRegistry::new();
    sources.register(
        "broken",
        Arc::new(FlakySource::new(numbered(4_000, 4), 3_500, 1, false)),
    );
    let agg = PlanNode::with_inputs(
        "agg",
        PlanOp::Aggregate {
            group_by: vec!["g".into()],
            aggregates: vec![AggregateExpr::count_all("n")],
        },
        vec![scan("scan", "broken", 4_000)],
    );
    let handle = executor(&sources, true).submit_with(Plan::new(agg), RuntimeHints::with_workers(4))?;
    let (rows, status) = collect(&handle)?;
    assert!(rows.is_empty());
    match status {
        ExecutionStatus::Failed { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::FatalOperator);
            assert!(message.contains("injected corruption"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(handle.progress().state, lakeflow::ProgressState::Failed);
    Ok(())
}

fn table_of(rows: &[Row], start: usize, end: usize) -> GroupTable {
    let mut table = GroupTable::new(
        vec!["g".into()],
        vec![
            AggregateExpr::count_all("n"),
            AggregateExpr::new(AggFunc::Count, "v", "present"),
            AggregateExpr::new(AggFunc::Sum, "v", "total"),
            AggregateExpr::new(AggFunc::Min, "v", "lo"),
            AggregateExpr::new(AggFunc::Max, "v", "hi"),
            AggregateExpr::new(AggFunc::Avg, "v", "mean"),
        ],
    );
    for row in &rows[start..end] {
        table.accumulate(row);
    }
    table
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn partial_merge_order_does_not_change_results(
        values in proptest::collection::vec((0i64..6, proptest::option::of(-1_000i64..1_000)), 1..120),
        cuts in proptest::collection::vec(0usize..120, 0..6),
        rotation in 0usize..8,
    ) {
        let rows: Vec<Row> = values
            .iter()
            .map(|(g, v)| row([("g", Value::Int(*g)), ("v", v.map_or(Value::Null, Value::Int))]))
            .collect();
        let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c % (rows.len() + 1)).collect();
        bounds.push(0);
        bounds.push(rows.len());
        bounds.sort_unstable();
        bounds.dedup();

        let expected = sorted(table_of(&rows, 0, rows.len()).into_rows());

        let mut partials: Vec<GroupTable> = bounds
            .windows(2)
            .map(|w| table_of(&rows, w[0], w[1]))
            .collect();
        let len = partials.len();
        partials.rotate_left(rotation % len);
        partials.reverse();

        let mut merged = table_of(&rows, 0, 0);
        for partial in partials {
            merged.merge(partial);
        }
        prop_assert_eq!(sorted(merged.into_rows()), expected);
    }
}
