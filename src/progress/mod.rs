#![forbid(unsafe_code)]

//! Progress tracking for running executions.
//!
//! A [`ProgressTracker`] counts leaf input rows against the optimizer's
//! cardinality estimate and derives percent complete and a remaining-time
//! estimate. The estimate is taken once at submission and never revised, so
//! a poor estimate shows up as a percent that stalls near 100 or jumps at
//! completion.
//!
//! Registered handlers are invoked on a row or time cadence from whichever
//! thread reports rows. A panicking handler is caught and logged; it never
//! affects the query.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProgressOptions;

/// Lifecycle of a tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProgressState {
    /// Submitted, not yet started.
    Pending,
    /// Executing.
    Running,
    /// Notifications suspended by the caller.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl ProgressState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressState::Completed | ProgressState::Failed | ProgressState::Cancelled
        )
    }
}

/// Read-only view of an execution's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Current lifecycle state.
    pub state: ProgressState,
    /// Percent complete in `[0, 100]`.
    pub percent: f64,
    /// Leaf input rows processed so far.
    pub rows_processed: u64,
    /// Cardinality estimate fixed at submission.
    pub estimated_total_rows: u64,
    /// Time since the execution started.
    pub elapsed: Duration,
    /// Estimated time left; `None` until some progress has been made.
    pub estimated_remaining: Option<Duration>,
    /// Name of the phase currently executing.
    pub phase: String,
}

/// Callback invoked with a fresh snapshot on every notification tick.
pub type ProgressHandler = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

struct TrackerState {
    state: ProgressState,
    phase: String,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    last_notified_rows: u64,
    last_notified_at: Instant,
}

/// Tracks one execution's progress and notifies registered handlers.
pub struct ProgressTracker {
    estimated_total: u64,
    options: ProgressOptions,
    rows: AtomicU64,
    inner: Mutex<TrackerState>,
    handlers: RwLock<Vec<ProgressHandler>>,
}

impl ProgressTracker {
    /// Creates a tracker in the `Pending` state.
    pub fn new(estimated_total: u64, options: ProgressOptions) -> Self {
        Self {
            estimated_total,
            options,
            rows: AtomicU64::new(0),
            inner: Mutex::new(TrackerState {
                state: ProgressState::Pending,
                phase: "pending".to_owned(),
                started_at: None,
                finished_at: None,
                last_notified_rows: 0,
                last_notified_at: Instant::now(),
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a notification handler.
    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// `Pending -> Running`.
    pub fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ProgressState::Pending {
            return false;
        }
        let now = Instant::now();
        inner.state = ProgressState::Running;
        inner.started_at = Some(now);
        inner.last_notified_at = now;
        true
    }

    /// `Running -> Paused`. Stops notifications; computation continues
    /// unless an operator checks [`ProgressTracker::is_paused`].
    pub fn pause(&self) -> bool {
        self.transition(ProgressState::Running, ProgressState::Paused)
    }

    /// `Paused -> Running`.
    pub fn resume(&self) -> bool {
        self.transition(ProgressState::Paused, ProgressState::Running)
    }

    /// Whether notifications are currently paused.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().state == ProgressState::Paused
    }

    /// Moves to `Completed`, firing a final notification.
    pub fn complete(&self) -> bool {
        self.finish(ProgressState::Completed)
    }

    /// Moves to `Failed`, firing a final notification.
    pub fn fail(&self) -> bool {
        self.finish(ProgressState::Failed)
    }

    /// Moves to `Cancelled`, firing a final notification.
    pub fn cancel(&self) -> bool {
        self.finish(ProgressState::Cancelled)
    }

    /// Names the phase currently executing.
    pub fn set_phase(&self, phase: impl Into<String>) {
        let phase = phase.into();
        debug!(phase = %phase, "progress.phase");
        self.inner.lock().phase = phase;
    }

    /// Adds processed leaf rows and notifies handlers when the cadence is due.
    pub fn add_rows(&self, rows: u64) {
        if rows == 0 {
            return;
        }
        let total = self.rows.fetch_add(rows, Ordering::Relaxed) + rows;
        let due = {
            let mut inner = self.inner.lock();
            if inner.state != ProgressState::Running {
                false
            } else {
                let row_due = total.saturating_sub(inner.last_notified_rows)
                    >= self.options.every_rows;
                let time_due = inner.last_notified_at.elapsed() >= self.options.every;
                if row_due || time_due {
                    inner.last_notified_rows = total;
                    inner.last_notified_at = Instant::now();
                }
                row_due || time_due
            }
        };
        if due {
            self.notify();
        }
    }

    /// Computes the current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let rows = self.rows.load(Ordering::Relaxed);
        let inner = self.inner.lock();
        let elapsed = match (inner.started_at, inner.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let percent = if inner.state == ProgressState::Completed {
            100.0
        } else {
            percent_of(rows, self.estimated_total)
        };
        let estimated_remaining = if inner.state.is_terminal() {
            Some(Duration::ZERO).filter(|_| inner.state == ProgressState::Completed)
        } else {
            remaining(elapsed, percent)
        };
        ProgressSnapshot {
            state: inner.state,
            percent,
            rows_processed: rows,
            estimated_total_rows: self.estimated_total,
            elapsed,
            estimated_remaining,
            phase: inner.phase.clone(),
        }
    }

    fn transition(&self, from: ProgressState, to: ProgressState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        debug!(from = ?from, to = ?to, "progress.transition");
        true
    }

    fn finish(&self, terminal: ProgressState) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            let now = Instant::now();
            inner.started_at.get_or_insert(now);
            inner.finished_at = Some(now);
            inner.state = terminal;
        }
        self.notify();
        true
    }

    fn notify(&self) {
        let handlers: Vec<ProgressHandler> = self.handlers.read().clone();
        if handlers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&snapshot)));
            if let Err(payload) = outcome {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                warn!(reason = %reason, "progress.handler.panicked");
            }
        }
    }
}

fn percent_of(rows: u64, total: u64) -> f64 {
    if total == 0 {
        return if rows > 0 { 100.0 } else { 0.0 };
    }
    (rows as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if percent <= 0.0 {
        return None;
    }
    let fraction = percent / 100.0;
    Duration::try_from_secs_f64(elapsed.as_secs_f64() * (1.0 - fraction) / fraction).ok()
}
