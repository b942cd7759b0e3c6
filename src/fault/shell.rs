//! Checkpointing, bounded retry and recovery around resumable operator tasks.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::{CheckpointOptions, RetryPolicy};
use crate::exec::{CancellationToken, ExecutionStats};
use crate::fault::checkpoint::{CheckpointRecord, CheckpointStore, OperatorSnapshot};
use crate::fault::detector::{FailureDetector, FailureVerdict};
use crate::progress::ProgressTracker;
use crate::types::{ExecError, OperatorId, QueryId, Result};

/// Per-operator execution state tracked by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorState {
    /// Making progress.
    Running,
    /// Backing off after a transient failure before resuming.
    Retrying,
    /// Retry budget exhausted; the recovery handler is running.
    Recovering,
    /// Terminal failure.
    Failed,
    /// Finished successfully.
    Completed,
    /// Stopped by cancellation.
    Cancelled,
}

/// Result of one operator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More input remains.
    Continue,
    /// Input exhausted; the task may be finished.
    Done,
}

/// An operator task whose progress can be snapshotted and restored.
///
/// `step` processes one batch. Between steps the shell may take a snapshot,
/// and after a failure it restores the latest one (or resets the task) and
/// keeps stepping.
pub trait Resumable: Send {
    /// Value produced once the task is done.
    type Output;

    /// Identity used for checkpoints, failure accounting and errors.
    fn operator_id(&self) -> &OperatorId;

    /// Input positions consumed so far.
    fn position(&self) -> u64;

    /// Whether consumed positions are leaf rows that count toward progress.
    fn counts_toward_progress(&self) -> bool {
        false
    }

    /// Processes the next batch.
    fn step(&mut self) -> Result<StepOutcome>;

    /// Captures the state reached so far.
    fn snapshot(&self) -> OperatorSnapshot;

    /// Replaces the current state with a snapshot.
    fn restore(&mut self, snapshot: OperatorSnapshot) -> Result<()>;

    /// Returns to the initial state.
    fn reset(&mut self);

    /// Called after a snapshot has been durably written.
    fn checkpoint_committed(&mut self) -> Result<()> {
        Ok(())
    }

    /// Consumes the task and yields its output.
    fn finish(self) -> Result<Self::Output>;
}

/// Last-chance hook invoked once per operator when its retry budget is
/// exhausted. Returning `Ok` resumes the operator from its latest checkpoint
/// with a fresh budget; returning `Err` fails it.
pub trait RecoveryHandler: Send + Sync {
    /// Attempts to repair whatever made `operator` fail with `error`.
    fn recover(&self, operator: &OperatorId, error: &ExecError) -> Result<()>;
}

impl<F> RecoveryHandler for F
where
    F: Fn(&OperatorId, &ExecError) -> Result<()> + Send + Sync,
{
    fn recover(&self, operator: &OperatorId, error: &ExecError) -> Result<()> {
        self(operator, error)
    }
}

/// Runs resumable tasks with checkpointing and bounded retry.
///
/// One shell serves every operator of a query and is shared across worker
/// threads.
pub struct FaultTolerantShell {
    query_id: QueryId,
    store: Arc<dyn CheckpointStore>,
    checkpoint: CheckpointOptions,
    retry: RetryPolicy,
    detector: Arc<FailureDetector>,
    recovery: Option<Arc<dyn RecoveryHandler>>,
    stats: Arc<ExecutionStats>,
    progress: Option<Arc<ProgressTracker>>,
    states: Mutex<FxHashMap<OperatorId, OperatorState>>,
}

enum Restore {
    FromCheckpoint,
    FromStart,
}

impl FaultTolerantShell {
    /// Creates a shell for one query.
    pub fn new(
        query_id: QueryId,
        store: Arc<dyn CheckpointStore>,
        checkpoint: CheckpointOptions,
        retry: RetryPolicy,
        detector: Arc<FailureDetector>,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            query_id,
            store,
            checkpoint,
            retry,
            detector,
            recovery: None,
            stats,
            progress: None,
            states: Mutex::new(FxHashMap::default()),
        }
    }

    /// Installs a recovery handler.
    pub fn with_recovery(mut self, handler: Option<Arc<dyn RecoveryHandler>>) -> Self {
        self.recovery = handler;
        self
    }

    /// Reports leaf rows to a progress tracker.
    pub fn with_progress(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Query this shell belongs to.
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// Checkpoint store in use.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Checkpoint cadence in use.
    pub fn checkpoint_options(&self) -> &CheckpointOptions {
        &self.checkpoint
    }

    /// Shared execution counters.
    pub fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    /// Latest state recorded for `operator`.
    pub fn state(&self, operator: &OperatorId) -> Option<OperatorState> {
        self.states.lock().get(operator).copied()
    }

    /// Every operator state recorded so far, sorted by operator id.
    pub fn states(&self) -> Vec<(OperatorId, OperatorState)> {
        let mut states: Vec<_> = self
            .states
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Drops every checkpoint of this query. Failures are logged.
    pub fn clear_checkpoints(&self) {
        if let Err(err) = self.store.clear_query(&self.query_id) {
            warn!(query_id = %self.query_id, error = %err, "fault.checkpoint.clear_failed");
        }
    }

    fn set_state(&self, operator: &OperatorId, state: OperatorState) {
        self.states.lock().insert(operator.clone(), state);
    }

    /// Drives `task` to completion, checkpointing and retrying as configured.
    pub fn run<T: Resumable>(&self, mut task: T, cancel: &CancellationToken) -> Result<T::Output> {
        let operator = task.operator_id().clone();
        self.set_state(&operator, OperatorState::Running);

        let mut sequence = self.resume_previous_run(&mut task);
        let mut high_water = task.position();
        let mut checkpointed_at = (task.position(), Instant::now());
        let mut attempts: u32 = 0;
        let mut recovered = false;
        // Set between a transient failure and the next step that moves past
        // the high-water mark.
        let mut failing = false;

        loop {
            if cancel.is_cancelled() {
                self.set_state(&operator, OperatorState::Cancelled);
                return Err(ExecError::Cancelled);
            }
            match task.step() {
                Ok(StepOutcome::Continue) => {
                    let position = task.position();
                    if position > high_water {
                        if task.counts_toward_progress() {
                            if let Some(progress) = &self.progress {
                                progress.add_rows(position - high_water);
                            }
                        }
                        high_water = position;
                        if failing {
                            self.detector.reset(&operator);
                            failing = false;
                        }
                    }
                    let rows_due =
                        position.saturating_sub(checkpointed_at.0) >= self.checkpoint.every_rows;
                    let time_due = checkpointed_at.1.elapsed() >= self.checkpoint.every;
                    if rows_due || time_due {
                        sequence += 1;
                        if self.write_checkpoint(&mut task, sequence)? {
                            attempts = 0;
                        }
                        checkpointed_at = (position, Instant::now());
                    }
                }
                Ok(StepOutcome::Done) => {
                    let position = task.position();
                    if position > high_water && task.counts_toward_progress() {
                        if let Some(progress) = &self.progress {
                            progress.add_rows(position - high_water);
                        }
                    }
                    if let Err(err) = self.store.clear_operator(&self.query_id, &operator) {
                        warn!(operator = %operator, error = %err, "fault.checkpoint.clear_failed");
                    }
                    self.detector.reset(&operator);
                    let output = task.finish();
                    let state = match &output {
                        Ok(_) => OperatorState::Completed,
                        Err(ExecError::Cancelled) => OperatorState::Cancelled,
                        Err(_) => OperatorState::Failed,
                    };
                    self.set_state(&operator, state);
                    return output;
                }
                Err(err) if err.is_transient() => {
                    failing = true;
                    if let FailureVerdict::ThresholdExceeded { recent } =
                        self.detector.record(&operator, err.kind(), err.to_string())
                    {
                        self.set_state(&operator, OperatorState::Failed);
                        error!(operator = %operator, recent, error = %err, "fault.shell.permanently_failed");
                        return Err(ExecError::fatal(
                            &operator,
                            format!("failure threshold exceeded after {recent} failures: {err}"),
                        ));
                    }
                    attempts += 1;
                    if attempts > self.retry.max_attempts {
                        let handler = match (&self.recovery, recovered) {
                            (Some(handler), false) => Arc::clone(handler),
                            _ => {
                                self.set_state(&operator, OperatorState::Failed);
                                error!(
                                    operator = %operator,
                                    attempts = attempts - 1,
                                    error = %err,
                                    "fault.shell.retries_exhausted"
                                );
                                return Err(ExecError::fatal(
                                    &operator,
                                    format!(
                                        "retry budget of {} attempts exhausted: {err}",
                                        self.retry.max_attempts
                                    ),
                                ));
                            }
                        };
                        recovered = true;
                        self.recover(&mut task, handler.as_ref(), &err)?;
                        attempts = 0;
                        checkpointed_at = (task.position(), Instant::now());
                        continue;
                    }

                    self.set_state(&operator, OperatorState::Retrying);
                    self.stats.add_retries(1);
                    let delay = self.retry.backoff(attempts);
                    debug!(
                        operator = %operator,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fault.shell.retry_scheduled"
                    );
                    if cancel.wait_timeout(delay) {
                        self.set_state(&operator, OperatorState::Cancelled);
                        return Err(ExecError::Cancelled);
                    }
                    let before = task.position();
                    if let Restore::FromStart = self.restore_latest(&mut task) {
                        warn!(operator = %operator, "fault.shell.full_restart");
                    }
                    self.stats
                        .add_rows_replayed(before.saturating_sub(task.position()));
                    checkpointed_at = (task.position(), Instant::now());
                    self.set_state(&operator, OperatorState::Running);
                }
                Err(ExecError::Cancelled) => {
                    self.set_state(&operator, OperatorState::Cancelled);
                    return Err(ExecError::Cancelled);
                }
                Err(err) => {
                    self.set_state(&operator, OperatorState::Failed);
                    error!(operator = %operator, code = err.code(), error = %err, "fault.shell.operator_failed");
                    return Err(err);
                }
            }
        }
    }

    /// Restores a checkpoint left by an earlier run of the same query and
    /// returns the sequence number to continue from.
    fn resume_previous_run<T: Resumable>(&self, task: &mut T) -> u64 {
        let operator = task.operator_id().clone();
        match self.store.read_latest(&self.query_id, &operator) {
            Ok(Some(record)) => {
                let sequence = record.sequence;
                match task.restore(record.snapshot) {
                    Ok(()) => {
                        self.stats.add_operators_resumed(1);
                        info!(
                            operator = %operator,
                            sequence,
                            position = task.position(),
                            "fault.shell.resumed"
                        );
                    }
                    Err(err) => {
                        error!(operator = %operator, error = %err, "fault.checkpoint.restore_failed");
                        task.reset();
                    }
                }
                sequence
            }
            Ok(None) => 0,
            Err(err) => {
                error!(operator = %operator, error = %err, "fault.checkpoint.read_failed");
                task.reset();
                0
            }
        }
    }

    /// Writes a checkpoint. Returns whether it was committed; write failures
    /// are logged and skipped.
    fn write_checkpoint<T: Resumable>(&self, task: &mut T, sequence: u64) -> Result<bool> {
        let operator = task.operator_id().clone();
        let record = CheckpointRecord::new(
            self.query_id.clone(),
            operator.clone(),
            sequence,
            task.snapshot(),
        );
        match self.store.write(&record) {
            Ok(()) => {
                self.stats.add_checkpoints_written(1);
                debug!(
                    operator = %operator,
                    sequence,
                    position = task.position(),
                    "fault.checkpoint.written"
                );
                task.checkpoint_committed()?;
                Ok(true)
            }
            Err(err) => {
                self.stats.add_checkpoints_failed(1);
                warn!(operator = %operator, sequence, error = %err, "fault.checkpoint.write_failed");
                Ok(false)
            }
        }
    }

    /// Restores the latest checkpoint while retrying. Any read or decode
    /// failure restarts the operator from its initial state.
    fn restore_latest<T: Resumable>(&self, task: &mut T) -> Restore {
        let operator = task.operator_id().clone();
        let record = match self.store.read_latest(&self.query_id, &operator) {
            Ok(Some(record)) => record,
            Ok(None) => {
                task.reset();
                return Restore::FromStart;
            }
            Err(err) => {
                error!(operator = %operator, error = %err, "fault.checkpoint.read_failed");
                task.reset();
                return Restore::FromStart;
            }
        };
        match task.restore(record.snapshot) {
            Ok(()) => Restore::FromCheckpoint,
            Err(err) => {
                error!(operator = %operator, error = %err, "fault.checkpoint.restore_failed");
                task.reset();
                Restore::FromStart
            }
        }
    }

    /// Runs the recovery handler, then restores authoritatively: a checkpoint
    /// that cannot be read fails the query.
    fn recover<T: Resumable>(
        &self,
        task: &mut T,
        handler: &dyn RecoveryHandler,
        cause: &ExecError,
    ) -> Result<()> {
        let operator = task.operator_id().clone();
        self.set_state(&operator, OperatorState::Recovering);
        self.stats.add_recoveries(1);
        info!(operator = %operator, error = %cause, "fault.shell.recovering");

        if let Err(err) = handler.recover(&operator, cause) {
            self.set_state(&operator, OperatorState::Failed);
            error!(operator = %operator, error = %err, "fault.shell.recovery_failed");
            return Err(ExecError::fatal(
                &operator,
                format!("recovery failed: {err}; original failure: {cause}"),
            ));
        }

        let before = task.position();
        let restored = self
            .store
            .read_latest(&self.query_id, &operator)
            .and_then(|record| match record {
                Some(record) => task.restore(record.snapshot),
                None => {
                    task.reset();
                    Ok(())
                }
            });
        if let Err(err) = restored {
            self.set_state(&operator, OperatorState::Failed);
            error!(operator = %operator, error = %err, "fault.checkpoint.read_failed");
            return Err(ExecError::checkpoint(
                &operator,
                format!("checkpoint unreadable during recovery: {err}"),
            ));
        }
        self.stats
            .add_rows_replayed(before.saturating_sub(task.position()));
        self.set_state(&operator, OperatorState::Running);
        Ok(())
    }
}
