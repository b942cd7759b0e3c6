//! Single-threaded execution on the runner thread.

use std::sync::Arc;

use tracing::debug;

use crate::exec::walker::Backend;
use crate::exec::CancellationToken;
use crate::fault::FaultTolerantShell;
use crate::ops::{
    AggregateTask, BuildSide, GroupTable, JoinTable, RowInput, RowSink, RowTransform, RowsTask,
};
use crate::types::{OperatorId, Result, Row};

/// Runs every operator as one task inside the shell, on the calling thread.
pub struct SerialEngine {
    shell: Arc<FaultTolerantShell>,
    cancel: CancellationToken,
    batch_size: usize,
}

impl SerialEngine {
    /// Creates an engine for one query.
    pub fn new(shell: Arc<FaultTolerantShell>, cancel: CancellationToken, batch_size: usize) -> Self {
        Self {
            shell,
            cancel,
            batch_size,
        }
    }
}

impl Backend for SerialEngine {
    fn pipeline(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>> {
        let mut task = RowsTask::new(id.clone(), input, transform, self.batch_size);
        if let Some(sink) = sink {
            task = task.with_sink(sink.clone());
        }
        self.shell.run(task, &self.cancel)
    }

    fn hash_join(
        &self,
        id: &OperatorId,
        left: Vec<Row>,
        right: Vec<Row>,
        left_key: &str,
        right_key: &str,
    ) -> Result<Vec<Row>> {
        let (build_side, build, build_key, probe, probe_key) = if left.len() <= right.len() {
            (BuildSide::Left, left, left_key, right, right_key)
        } else {
            (BuildSide::Right, right, right_key, left, left_key)
        };
        let table = JoinTable::build(build.iter(), build_key);
        debug!(
            operator = %id,
            build_side = ?build_side,
            build_rows = build.len(),
            probe_rows = probe.len(),
            "serial.join.built"
        );
        let transform = RowTransform::Probe {
            table: Arc::new(table),
            probe_key: probe_key.to_owned(),
            build_side,
        };
        let task = RowsTask::new(id.clone(), RowInput::rows(probe), transform, self.batch_size);
        self.shell.run(task, &self.cancel)
    }

    fn aggregate(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
    ) -> Result<Vec<Row>> {
        let task = AggregateTask::new(id.clone(), input, transform, table, self.batch_size);
        Ok(self.shell.run(task, &self.cancel)?.into_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecConfig, FailureDetectorOptions};
    use crate::exec::walker::PlanWalker;
    use crate::exec::ExecutionStats;
    use crate::fault::{FailureDetector, InMemoryCheckpointStore};
    use crate::plan::{
        AggFunc, AggregateExpr, CmpOp, MemTable, PlanNode, PlanOp, Predicate, SortKey,
        SourceRegistry,
    };
    use crate::types::{row, ExecError, QueryId, Value};

    fn engine() -> SerialEngine {
        let config = ExecConfig::default();
        let shell = FaultTolerantShell::new(
            QueryId::from("serial"),
            Arc::new(InMemoryCheckpointStore::default()),
            config.checkpoint.clone(),
            config.retry.clone(),
            Arc::new(FailureDetector::new(&FailureDetectorOptions::default())),
            Arc::new(ExecutionStats::default()),
        );
        SerialEngine::new(Arc::new(shell), CancellationToken::new(), 16)
    }

    fn sources() -> SourceRegistry {
        let registry = SourceRegistry::new();
        let orders = (0..50i64).map(|i| row([("id", i), ("cust", i % 5), ("amount", i)]));
        let customers = (0..5i64).map(|i| row([("cid", i), ("tier", i % 2)]));
        registry.register("orders", Arc::new(MemTable::new(orders.collect())));
        registry.register("customers", Arc::new(MemTable::new(customers.collect())));
        registry
    }

    fn scan(id: &str, table: &str) -> PlanNode {
        PlanNode::new(id, PlanOp::Scan { table: table.into() })
    }

    #[test]
    fn join_then_aggregate_then_sort() -> Result<()> {
        let join = PlanNode::with_inputs(
            "join",
            PlanOp::HashJoin {
                left_key: "cust".into(),
                right_key: "cid".into(),
            },
            vec![scan("o", "orders"), scan("c", "customers")],
        );
        let agg = PlanNode::with_inputs(
            "agg",
            PlanOp::Aggregate {
                group_by: vec!["tier".into()],
                aggregates: vec![
                    AggregateExpr::count_all("n"),
                    AggregateExpr::new(AggFunc::Sum, "amount", "total"),
                ],
            },
            vec![join],
        );
        let sort = PlanNode::with_inputs(
            "sort",
            PlanOp::Sort {
                keys: vec![SortKey::asc("tier")],
            },
            vec![agg],
        );
        let engine = engine();
        let sources = sources();
        let rows = PlanWalker::new(&engine, &sources, 16).evaluate(&sort)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["tier"], Value::Int(0));
        assert_eq!(rows[0]["n"], Value::Int(30));
        assert_eq!(rows[1]["n"], Value::Int(20));
        Ok(())
    }

    #[test]
    fn filters_fuse_into_the_scan() -> Result<()> {
        let filter = PlanNode::with_inputs(
            "f",
            PlanOp::Filter {
                predicate: Predicate::compare("amount", CmpOp::Ge, 40i64),
            },
            vec![scan("o", "orders")],
        );
        let limit = PlanNode::with_inputs("lim", PlanOp::Limit { count: 3 }, vec![filter]);
        let engine = engine();
        let sources = sources();
        let rows = PlanWalker::new(&engine, &sources, 16).evaluate(&limit)?;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r["amount"] >= Value::Int(40)));
        Ok(())
    }

    #[test]
    fn unknown_tables_and_stream_operators_are_fatal() {
        let engine = engine();
        let sources = sources();
        let walker = PlanWalker::new(&engine, &sources, 16);
        let missing = walker.evaluate(&scan("s", "nope"));
        assert!(matches!(missing, Err(ExecError::FatalOperator { .. })));
        let stream = PlanNode::new("src", PlanOp::StreamSource { stream: "s".into() });
        assert!(matches!(
            walker.evaluate(&stream),
            Err(ExecError::FatalOperator { .. })
        ));
    }
}
