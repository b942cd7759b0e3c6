mod common;

use std::sync::Arc;

use common::{init_tracing, sorted};
use lakeflow::plan::{AggregateExpr, CmpOp, Predicate};
use lakeflow::streaming::{WINDOW_END, WINDOW_START};
use lakeflow::types::row;
use lakeflow::{
    ExecConfig, ExecutionStatus, ExecutionStrategy, Plan, PlanNode, PlanOp, QueryExecutor,
    Result, Row, SourceRegistry, StreamMatch, Value,
};
use parking_lot::Mutex;

fn executor() -> QueryExecutor {
    QueryExecutor::new(ExecConfig::default(), SourceRegistry::new())
}

fn source(id: &str, stream: &str) -> PlanNode {
    PlanNode::new(
        id,
        PlanOp::StreamSource {
            stream: stream.into(),
        },
    )
}

fn tumbling_count(input: PlanNode, window_ms: u64) -> Plan {
    Plan::new(PlanNode::with_inputs(
        "window",
        PlanOp::WindowAggregate {
            window_ms,
            slide_ms: window_ms,
            group_by: Vec::new(),
            aggregates: vec![AggregateExpr::count_all("n")],
        },
        vec![input],
    ))
}

/// `(window_start, n)` pairs in emission order.
fn counts(rows: &[Row]) -> Vec<(i64, i64)> {
    rows.iter()
        .filter_map(|r| Some((r.get(WINDOW_START)?.as_i64()?, r.get("n")?.as_i64()?)))
        .collect()
}

#[test]
fn tumbling_windows_emit_on_close_and_flush_at_end() -> Result<()> {
    init_tracing();
    let executor = executor();
    let ticks = executor.streams().open("ticks");

    let handle = executor.submit(tumbling_count(source("src", "ticks"), 5_000))?;
    assert_eq!(handle.strategy(), ExecutionStrategy::Streaming);
    for i in 0..12i64 {
        ticks.send(i * 1_000, row([("seq", i)]))?;
    }
    drop(ticks);
    executor.streams().close("ticks");

    let rows: Vec<Row> = handle.results()?.collect();
    assert_eq!(counts(&rows), vec![(0, 5), (5_000, 5), (10_000, 2)]);
    for r in &rows {
        let start = r.get(WINDOW_START).and_then(Value::as_i64);
        let end = r.get(WINDOW_END).and_then(Value::as_i64);
        assert_eq!(end, start.map(|s| s + 5_000));
    }
    assert_eq!(handle.wait(), ExecutionStatus::Completed);
    assert_eq!(handle.stats().rows_emitted, 3);
    Ok(())
}

#[test]
fn cancellation_flushes_open_windows() -> Result<()> {
    init_tracing();
    let executor = executor();
    let ticks = executor.streams().open("ticks");

    let handle = executor.submit(tumbling_count(source("src", "ticks"), 5_000))?;
    let mut results = handle.results()?;
    for i in 0..7i64 {
        ticks.send(i * 1_000, row([("seq", i)]))?;
    }

    // The event at 6000 closes the first window, so both later events are
    // already folded in once it arrives.
    let first = results.next();
    assert_eq!(first.as_ref().map(|r| counts(std::slice::from_ref(r))), Some(vec![(0, 5)]));

    handle.cancel();
    let rest: Vec<Row> = results.collect();
    assert_eq!(counts(&rest), vec![(5_000, 2)]);
    assert_eq!(handle.wait(), ExecutionStatus::Cancelled);
    // The producer sees the query is gone.
    assert!(ticks.send(8_000, row([("seq", 8i64)])).is_err());
    Ok(())
}

#[test]
fn filter_runs_before_the_window() -> Result<()> {
    init_tracing();
    let executor = executor();
    let ticks = executor.streams().open("ticks");

    let filter = PlanNode::with_inputs(
        "positive",
        PlanOp::Filter {
            predicate: Predicate::compare("v", CmpOp::Gt, 0i64),
        },
        vec![source("src", "ticks")],
    );
    let handle = executor.submit(tumbling_count(filter, 10_000))?;
    for i in 0..30i64 {
        let v = if i % 3 == 0 { -1 } else { i };
        ticks.send(i * 1_000, row([("v", v)]))?;
    }
    drop(ticks);
    executor.streams().close("ticks");

    let rows: Vec<Row> = handle.results()?.collect();
    // Each 10-event window holds 10 timestamps, 6 or 7 of them positive.
    assert_eq!(counts(&rows), vec![(0, 6), (10_000, 7), (20_000, 7)]);
    assert_eq!(handle.wait(), ExecutionStatus::Completed);
    Ok(())
}

#[test]
fn late_events_are_dropped_and_counted() -> Result<()> {
    init_tracing();
    let executor = executor();
    let ticks = executor.streams().open("ticks");

    let handle = executor.submit(tumbling_count(source("src", "ticks"), 5_000))?;
    ticks.send(0, row([("seq", 0i64)]))?;
    ticks.send(6_000, row([("seq", 1i64)]))?;
    ticks.send(1_000, row([("seq", 2i64)]))?;
    drop(ticks);
    executor.streams().close("ticks");

    let rows: Vec<Row> = handle.results()?.collect();
    assert_eq!(counts(&rows), vec![(0, 1), (5_000, 1)]);
    assert_eq!(handle.wait(), ExecutionStatus::Completed);
    assert_eq!(handle.stats().late_events_dropped, 1);
    Ok(())
}

#[test]
fn stream_join_matches_go_to_the_handler() -> Result<()> {
    init_tracing();
    let executor = executor();
    let matches: Arc<Mutex<Vec<StreamMatch>>> = Arc::default();
    let seen = Arc::clone(&matches);
    executor
        .streams()
        .on_match(move |m: &StreamMatch| seen.lock().push(m.clone()));

    let orders = executor.streams().open("orders");
    let payments = executor.streams().open("payments");
    let join = PlanNode::with_inputs(
        "paid",
        PlanOp::StreamJoin {
            left_key: "order_id".into(),
            right_key: "paid_order".into(),
            window_ms: 10_000,
        },
        vec![source("o", "orders"), source("p", "payments")],
    );
    let handle = executor.submit(Plan::new(join))?;
    assert_eq!(handle.strategy(), ExecutionStrategy::Streaming);

    orders.send(0, row([("order_id", 1i64), ("amount", 30i64)]))?;
    orders.send(1_000, row([("order_id", 2i64), ("amount", 45i64)]))?;
    orders.send(0, row([("order_id", 3i64), ("amount", 12i64)]))?;
    payments.send(500, row([("paid_order", 1i64)]))?;
    payments.send(2_000, row([("paid_order", 2i64)]))?;
    payments.send(3_000, row([("paid_order", 9i64)]))?;
    // Too far from order 3 to match.
    payments.send(10_500, row([("paid_order", 3i64)]))?;
    drop((orders, payments));
    executor.streams().close("orders");
    executor.streams().close("payments");

    let rows: Vec<Row> = handle.results()?.collect();
    assert!(rows.is_empty());
    assert_eq!(handle.wait(), ExecutionStatus::Completed);

    let mut pairs: Vec<(i64, i64)> = matches.lock().iter().map(|m| (m.left_ts, m.right_ts)).collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(0, 500), (1_000, 2_000)]);
    let joined = sorted(matches.lock().iter().map(|m| m.row.clone()).collect());
    assert!(joined
        .iter()
        .all(|r| r.get("order_id") == r.get("paid_order")));
    Ok(())
}

#[test]
fn a_stream_feeds_one_query_at_a_time() -> Result<()> {
    init_tracing();
    let executor = executor();
    let _ticks = executor.streams().open("ticks");

    let first = executor.submit(tumbling_count(source("src", "ticks"), 1_000))?;
    let second = executor.submit(tumbling_count(source("src", "ticks"), 1_000));
    assert!(matches!(
        second,
        Err(lakeflow::ExecError::Configuration(ref msg)) if msg.contains("already consumed")
    ));
    first.cancel();
    assert_eq!(first.wait(), ExecutionStatus::Cancelled);
    Ok(())
}
