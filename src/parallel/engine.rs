//! Partitioned scan, hash join and aggregation over per-query pools.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ExecConfig;
use crate::exec::{Backend, CancellationToken};
use crate::fault::FaultTolerantShell;
use crate::ops::{
    AggregateTask, BuildSide, GroupTable, JoinTable, RowInput, RowSink, RowTransform, RowsTask,
};
use crate::parallel::partition::{hash_partition, range_partitions};
use crate::parallel::pool::{PoolKind, TaskHandle, WorkerPool};
use crate::types::{ExecError, OperatorId, Result, Row};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs operators across `degree` partitions.
///
/// Scans read disjoint position ranges on the I/O pool. Joins and
/// aggregations run on the CPU pool. Each partition task runs inside the
/// shared fault-tolerant shell under a child cancellation token, so the
/// first fatal partition error stops its siblings.
pub struct ParallelEngine {
    degree: usize,
    batch_size: usize,
    channel_capacity: usize,
    shutdown_timeout: Duration,
    shell: Arc<FaultTolerantShell>,
    cancel: CancellationToken,
    io_pool: WorkerPool,
    cpu_pool: WorkerPool,
}

impl ParallelEngine {
    /// Creates the engine and its two worker pools. Fails when the pools'
    /// threads cannot be created.
    pub fn new(
        degree: usize,
        config: &ExecConfig,
        shell: Arc<FaultTolerantShell>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let degree = degree.max(1);
        let io_size = match config.io_pool_size {
            0 => degree,
            n => n,
        };
        let cpu_size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let io_pool = WorkerPool::new(PoolKind::Io, io_size)?;
        let cpu_pool = WorkerPool::new(PoolKind::Cpu, cpu_size)?;
        info!(
            query_id = %shell.query_id(),
            degree,
            io_workers = io_pool.size(),
            cpu_workers = cpu_pool.size(),
            "parallel.engine.started"
        );
        Ok(Self {
            degree,
            batch_size: config.batch_size,
            channel_capacity: config.channel_capacity.max(1),
            shutdown_timeout: config.shutdown_timeout,
            shell,
            cancel,
            io_pool,
            cpu_pool,
        })
    }

    /// Number of partitions per operator.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Tears both pools down, waiting at most the configured timeout for
    /// each. Returns whether every worker exited in time.
    pub fn shutdown(self) -> bool {
        let timeout = self.shutdown_timeout;
        let io = self.io_pool.shutdown(timeout);
        let cpu = self.cpu_pool.shutdown(timeout);
        io && cpu
    }

    /// Range-partitioned scan of `input` through `transform`.
    ///
    /// With a sink, batches are forwarded as partitions commit them and the
    /// returned vector is empty; otherwise rows are collected.
    pub fn scan(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>> {
        let pool = if input.is_source() {
            &self.io_pool
        } else {
            &self.cpu_pool
        };
        let parts = range_partitions(input.len(), self.degree)
            .into_iter()
            .map(|range| (input.slice(range), transform.clone()))
            .collect();
        self.run_partitions(id, parts, pool, sink)
    }

    /// Partitioned hash join. The smaller input is hash-partitioned into one
    /// table per worker; the other input is routed with the same function.
    pub fn hash_join(
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
        debug!(
            operator = %id,
            build_side = ?build_side,
            build_rows = build.len(),
            probe_rows = probe.len(),
            partitions = self.degree,
            "parallel.join.partitioned"
        );
        let build_parts = hash_partition(build, &[build_key.to_owned()], self.degree);
        let probe_parts = hash_partition(probe, &[probe_key.to_owned()], self.degree);

        let builders: Vec<TaskHandle<JoinTable>> = build_parts
            .into_iter()
            .enumerate()
            .map(|(i, rows)| {
                let key = build_key.to_owned();
                self.cpu_pool.spawn(id.partition(i), move || {
                    let mut table = JoinTable::default();
                    for row in rows {
                        table.insert(row, &key);
                    }
                    table
                })
            })
            .collect();
        let mut tables = Vec::with_capacity(builders.len());
        for builder in builders {
            tables.push(Arc::new(builder.join()?));
        }

        let parts = probe_parts
            .into_iter()
            .zip(tables)
            .map(|(rows, table)| {
                let transform = RowTransform::Probe {
                    table,
                    probe_key: probe_key.to_owned(),
                    build_side,
                };
                (RowInput::rows(rows), transform)
            })
            .collect();
        self.run_partitions(id, parts, &self.cpu_pool, None)
    }

    /// Partial aggregation per partition followed by a merge.
    ///
    /// Storage inputs and transformed inputs are range-partitioned; already
    /// materialized rows are hash-partitioned on the grouping columns.
    pub fn aggregate(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
    ) -> Result<Vec<Row>> {
        let parts: Vec<(RowInput, RowTransform)> =
            if input.is_source() || !transform.is_identity() {
                range_partitions(input.len(), self.degree)
                    .into_iter()
                    .map(|range| (input.slice(range), transform.clone()))
                    .collect()
            } else {
                let rows = input.read(0, input.len())?;
                hash_partition(rows, table.group_by(), self.degree)
                    .into_iter()
                    .map(|rows| (RowInput::rows(rows), RowTransform::Identity))
                    .collect()
            };
        self.shell.stats().add_partitions(parts.len() as u64);

        let token = self.cancel.child();
        let handles: Vec<TaskHandle<Result<GroupTable>>> = parts
            .into_iter()
            .enumerate()
            .map(|(i, (input, transform))| {
                let task = AggregateTask::new(
                    id.partition(i),
                    input,
                    transform,
                    table.empty_like(),
                    self.batch_size,
                );
                let shell = Arc::clone(&self.shell);
                let token = token.clone();
                self.cpu_pool
                    .spawn(id.partition(i), move || shell.run(task, &token))
            })
            .collect();

        let mut merged = table;
        let mut first_error = None;
        for handle in handles {
            match handle.join().and_then(|partial| partial) {
                Ok(partial) => merged.merge(partial),
                Err(err) => {
                    token.cancel();
                    keep_first(&mut first_error, err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        debug!(operator = %id, groups = merged.len(), "parallel.aggregate.merged");
        Ok(merged.into_rows())
    }

    /// Runs one `RowsTask` per partition, draining per-partition bounded
    /// channels round-robin. A closed channel means the partition finished.
    fn run_partitions(
        &self,
        id: &OperatorId,
        parts: Vec<(RowInput, RowTransform)>,
        pool: &WorkerPool,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>> {
        self.shell.stats().add_partitions(parts.len() as u64);
        let token = self.cancel.child();
        let mut receivers: Vec<Option<Receiver<Vec<Row>>>> = Vec::with_capacity(parts.len());
        let mut handles: Vec<Option<TaskHandle<Result<Vec<Row>>>>> = Vec::with_capacity(parts.len());
        for (i, (input, transform)) in parts.into_iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel(self.channel_capacity);
            let task = RowsTask::new(id.partition(i), input, transform, self.batch_size)
                .with_sink(tx);
            let shell = Arc::clone(&self.shell);
            let token = token.clone();
            handles.push(Some(pool.spawn(id.partition(i), move || shell.run(task, &token))));
            receivers.push(Some(rx));
        }

        let mut collected = Vec::new();
        let mut deliver = |batch: Vec<Row>| -> Result<()> {
            match sink {
                Some(sink) => sink.send(batch).map_err(|_| ExecError::Cancelled),
                None => {
                    collected.extend(batch);
                    Ok(())
                }
            }
        };

        let mut first_error = None;
        let mut open = receivers.len();
        'drain: while open > 0 {
            let mut progressed = false;
            for index in 0..receivers.len() {
                let Some(rx) = &receivers[index] else {
                    continue;
                };
                match rx.try_recv() {
                    Ok(batch) => {
                        progressed = true;
                        if let Err(err) = deliver(batch) {
                            first_error = Some(err);
                            break 'drain;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        progressed = true;
                        receivers[index] = None;
                        open -= 1;
                        if let Some(handle) = handles[index].take() {
                            if let Err(err) = handle.join().and_then(|rows| rows) {
                                first_error = Some(err);
                                break 'drain;
                            }
                        }
                    }
                }
            }
            if self.cancel.is_cancelled() {
                first_error = Some(ExecError::Cancelled);
                break;
            }
            if !progressed {
                if let Some(rx) = receivers.iter().flatten().next() {
                    match rx.recv_timeout(POLL_INTERVAL) {
                        Ok(batch) => {
                            if let Err(err) = deliver(batch) {
                                first_error = Some(err);
                                break;
                            }
                        }
                        // Closed channels are handled on the next pass.
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                    }
                }
            }
        }
        drop(deliver);

        if let Some(err) = first_error {
            token.cancel();
            // Unblock workers waiting on a full channel.
            drop(receivers);
            let mut first = Some(err);
            for handle in handles.into_iter().flatten() {
                if let Err(err) = handle.join().and_then(|rows| rows) {
                    keep_first(&mut first, err);
                }
            }
            return Err(first.unwrap_or(ExecError::Cancelled));
        }
        Ok(collected)
    }
}

/// Keeps the earliest real failure; cancellations caused by it rank lower.
fn keep_first(slot: &mut Option<ExecError>, err: ExecError) {
    match slot {
        None => *slot = Some(err),
        Some(ExecError::Cancelled) if !matches!(err, ExecError::Cancelled) => *slot = Some(err),
        Some(_) => {}
    }
}

impl Backend for ParallelEngine {
    fn pipeline(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        sink: Option<&RowSink>,
    ) -> Result<Vec<Row>> {
        self.scan(id, input, transform, sink)
    }

    fn hash_join(
        &self,
        id: &OperatorId,
        left: Vec<Row>,
        right: Vec<Row>,
        left_key: &str,
        right_key: &str,
    ) -> Result<Vec<Row>> {
        ParallelEngine::hash_join(self, id, left, right, left_key, right_key)
    }

    fn aggregate(
        &self,
        id: &OperatorId,
        input: RowInput,
        transform: RowTransform,
        table: GroupTable,
    ) -> Result<Vec<Row>> {
        ParallelEngine::aggregate(self, id, input, transform, table)
    }
}
