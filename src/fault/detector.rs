//! Sliding-window failure accounting per operator.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::config::FailureDetectorOptions;
use crate::types::{ErrorKind, OperatorId};

/// One observed operator failure.
#[derive(Clone, Debug)]
pub struct FailureRecord {
    /// Operator that failed.
    pub operator_id: OperatorId,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Failure description.
    pub message: String,
    /// When the failure was recorded.
    pub at: Instant,
}

/// Verdict returned after recording a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Failures in the window are within the threshold.
    WithinThreshold {
        /// Failures currently inside the window, including this one.
        recent: u32,
    },
    /// The operator failed more than the threshold within the window and
    /// must be treated as permanently failed.
    ThresholdExceeded {
        /// Failures currently inside the window, including this one.
        recent: u32,
    },
}

/// Counts failures per operator inside a sliding time window.
pub struct FailureDetector {
    window: Duration,
    threshold: u32,
    failures: Mutex<FxHashMap<OperatorId, VecDeque<FailureRecord>>>,
}

impl FailureDetector {
    /// Creates a detector from options.
    pub fn new(options: &FailureDetectorOptions) -> Self {
        Self {
            window: options.window,
            threshold: options.threshold,
            failures: Mutex::new(FxHashMap::default()),
        }
    }

    /// Records a failure and reports whether the operator crossed the
    /// threshold.
    pub fn record(
        &self,
        operator: &OperatorId,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> FailureVerdict {
        self.record_at(operator, kind, message, Instant::now())
    }

    fn record_at(
        &self,
        operator: &OperatorId,
        kind: ErrorKind,
        message: impl Into<String>,
        at: Instant,
    ) -> FailureVerdict {
        let mut failures = self.failures.lock();
        let history = failures.entry(operator.clone()).or_default();
        history.push_back(FailureRecord {
            operator_id: operator.clone(),
            kind,
            message: message.into(),
            at,
        });
        Self::evict(history, self.window, at);
        let recent = history.len() as u32;
        if recent > self.threshold {
            warn!(
                operator = %operator,
                recent,
                threshold = self.threshold,
                window_ms = self.window.as_millis() as u64,
                "fault.detector.threshold_exceeded"
            );
            FailureVerdict::ThresholdExceeded { recent }
        } else {
            FailureVerdict::WithinThreshold { recent }
        }
    }

    /// Forgets the failures of an operator that made progress or completed.
    pub fn reset(&self, operator: &OperatorId) {
        self.failures.lock().remove(operator);
    }

    /// Failures of `operator` still inside the window.
    pub fn recent_failures(&self, operator: &OperatorId) -> u32 {
        let mut failures = self.failures.lock();
        match failures.get_mut(operator) {
            Some(history) => {
                Self::evict(history, self.window, Instant::now());
                history.len() as u32
            }
            None => 0,
        }
    }

    /// Copy of the failures recorded for `operator` inside the window,
    /// oldest first.
    pub fn history(&self, operator: &OperatorId) -> Vec<FailureRecord> {
        let mut failures = self.failures.lock();
        match failures.get_mut(operator) {
            Some(history) => {
                Self::evict(history, self.window, Instant::now());
                history.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn evict(history: &mut VecDeque<FailureRecord>, window: Duration, now: Instant) {
        while let Some(front) = history.front() {
            if now.saturating_duration_since(front.at) > window {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}
