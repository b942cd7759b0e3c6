//! Caller-facing view of one running query.

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::vec;

use parking_lot::{Condvar, Mutex};

use crate::bridge::ExecutionStrategy;
use crate::exec::{CancellationToken, ExecutionStats, StatsSnapshot};
use crate::fault::{FaultTolerantShell, OperatorState};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::types::{ErrorKind, ExecError, OperatorId, QueryId, Result, Row};

/// Lifecycle of a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Still producing results.
    Running,
    /// Every result was produced.
    Completed,
    /// Aborted by an error.
    Failed {
        /// Operator the error originated in, when known.
        operator_id: Option<OperatorId>,
        /// Error classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
    /// Stopped by a cancellation request.
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the query has stopped.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub(crate) fn from_outcome(outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) => ExecutionStatus::Completed,
            Err(ExecError::Cancelled) => ExecutionStatus::Cancelled,
            Err(err) => ExecutionStatus::Failed {
                operator_id: err.operator_id().cloned(),
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => f.write_str("running"),
            ExecutionStatus::Completed => f.write_str("completed"),
            ExecutionStatus::Cancelled => f.write_str("cancelled"),
            ExecutionStatus::Failed {
                operator_id: Some(op),
                kind,
                ..
            } => write!(f, "failed ({kind} in {op})"),
            ExecutionStatus::Failed { kind, .. } => write!(f, "failed ({kind})"),
        }
    }
}

/// Terminal status published by the runner thread.
#[derive(Default)]
pub(crate) struct StatusCell {
    status: Mutex<Option<ExecutionStatus>>,
    cond: Condvar,
}

impl StatusCell {
    pub(crate) fn publish(&self, status: ExecutionStatus) {
        let mut slot = self.status.lock();
        if slot.is_none() {
            *slot = Some(status);
            self.cond.notify_all();
        }
    }

    fn current(&self) -> ExecutionStatus {
        self.status
            .lock()
            .clone()
            .unwrap_or(ExecutionStatus::Running)
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Option<ExecutionStatus> {
        let mut slot = self.status.lock();
        loop {
            if let Some(status) = slot.as_ref() {
                return Some(status.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        return slot.clone();
                    }
                }
                None => self.cond.wait(&mut slot),
            }
        }
    }
}

/// Outcome of [`ResultStream::next_timeout`].
#[derive(Debug, Clone, PartialEq)]
pub enum NextRow {
    /// The next row.
    Row(Row),
    /// Nothing arrived in time; the sequence is still open.
    TimedOut,
    /// The sequence ended.
    Ended,
}

/// Rows produced by a query, in delivery order.
///
/// Finite strategies end the sequence once the query stops; streaming
/// queries keep it open until their inputs close or they are cancelled.
/// Whether the query succeeded is reported by [`ExecutionHandle::status`].
pub struct ResultStream {
    rx: Receiver<Vec<Row>>,
    batch: vec::IntoIter<Row>,
    stats: Arc<ExecutionStats>,
}

impl ResultStream {
    fn new(rx: Receiver<Vec<Row>>, stats: Arc<ExecutionStats>) -> Self {
        Self {
            rx,
            batch: Vec::new().into_iter(),
            stats,
        }
    }

    /// Waits at most `timeout` for the next row.
    pub fn next_timeout(&mut self, timeout: Duration) -> NextRow {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(row) = self.batch.next() {
                return NextRow::Row(row);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(batch) => self.load(batch),
                Err(RecvTimeoutError::Timeout) => return NextRow::TimedOut,
                Err(RecvTimeoutError::Disconnected) => return NextRow::Ended,
            }
        }
    }

    fn load(&mut self, batch: Vec<Row>) {
        self.stats.add_rows_emitted(batch.len() as u64);
        self.batch = batch.into_iter();
    }
}

impl Iterator for ResultStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        loop {
            if let Some(row) = self.batch.next() {
                return Some(row);
            }
            let batch = self.rx.recv().ok()?;
            self.load(batch);
        }
    }
}

/// Handle to one submitted query.
pub struct ExecutionHandle {
    query_id: QueryId,
    strategy: ExecutionStrategy,
    degree: usize,
    results: Mutex<Option<Receiver<Vec<Row>>>>,
    progress: Arc<ProgressTracker>,
    stats: Arc<ExecutionStats>,
    shell: Arc<FaultTolerantShell>,
    cancel: CancellationToken,
    status: Arc<StatusCell>,
}

impl ExecutionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        query_id: QueryId,
        strategy: ExecutionStrategy,
        degree: usize,
        results: Receiver<Vec<Row>>,
        progress: Arc<ProgressTracker>,
        shell: Arc<FaultTolerantShell>,
        cancel: CancellationToken,
        status: Arc<StatusCell>,
    ) -> Self {
        Self {
            query_id,
            strategy,
            degree,
            results: Mutex::new(Some(results)),
            progress,
            stats: Arc::clone(shell.stats()),
            shell,
            cancel,
            status,
        }
    }

    /// Query identifier; resubmitting under it resumes from checkpoints.
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// Strategy the query runs with.
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Partitions per parallel operator.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Takes the result sequence. It can be taken once; re-running a query
    /// needs a new submission.
    pub fn results(&self) -> Result<ResultStream> {
        let rx = self
            .results
            .lock()
            .take()
            .ok_or_else(|| ExecError::config("results were already taken"))?;
        Ok(ResultStream::new(rx, Arc::clone(&self.stats)))
    }

    /// Current progress.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Registers a progress handler.
    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        self.progress.on_progress(handler);
    }

    /// Suspends progress notifications.
    pub fn pause(&self) -> bool {
        self.progress.pause()
    }

    /// Resumes progress notifications.
    pub fn resume(&self) -> bool {
        self.progress.resume()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // Unblock a runner waiting on a full result channel nobody reads.
        self.results.lock().take();
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.status.current()
    }

    /// Blocks until the query stops. Results not yet taken are discarded.
    pub fn wait(&self) -> ExecutionStatus {
        self.drain_untaken();
        self.status.wait_until(None).unwrap_or(ExecutionStatus::Running)
    }

    /// Like [`ExecutionHandle::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecutionStatus> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = self.results.lock();
            if let Some(rx) = slot.as_ref() {
                loop {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(left) {
                        Ok(_) => {}
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            *slot = None;
                            break;
                        }
                    }
                }
            }
        }
        self.status.wait_until(Some(deadline))
    }

    /// Execution counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Last recorded state of every operator task.
    pub fn operator_states(&self) -> Vec<(OperatorId, OperatorState)> {
        self.shell.states()
    }

    fn drain_untaken(&self) {
        if let Some(rx) = self.results.lock().take() {
            for _ in rx.iter() {}
        }
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("query_id", &self.query_id)
            .field("strategy", &self.strategy)
            .field("degree", &self.degree)
            .field("status", &self.status())
            .finish()
    }
}
