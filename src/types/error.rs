use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::OperatorId;

/// Result alias used throughout the execution core.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Coarse error classification surfaced to callers of an execution handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid resource configuration detected at submission.
    Configuration,
    /// Operator failure that may succeed when retried.
    TransientOperator,
    /// Operator failure that aborts the query.
    FatalOperator,
    /// Checkpoint storage failure.
    Checkpoint,
    /// Query was cancelled; not a true failure.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientOperator => "transient_operator",
            ErrorKind::FatalOperator => "fatal_operator",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors produced by the execution core.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Resource configuration is invalid; nothing was started.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Retryable operator failure.
    #[error("transient failure in operator {operator}: {message}")]
    TransientOperator {
        /// Operator that failed.
        operator: OperatorId,
        /// Failure description.
        message: String,
    },
    /// Non-retryable operator failure or exhausted retry budget.
    #[error("operator {operator} failed: {message}")]
    FatalOperator {
        /// Operator that failed.
        operator: OperatorId,
        /// Failure description.
        message: String,
    },
    /// Checkpoint could not be written or read.
    #[error("checkpoint error for operator {operator}: {message}")]
    Checkpoint {
        /// Operator whose checkpoint was involved.
        operator: OperatorId,
        /// Failure description.
        message: String,
    },
    /// The query was cancelled cooperatively.
    #[error("query cancelled")]
    Cancelled,
    /// I/O error from checkpoint storage or configuration files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Snapshot encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExecError {
    /// Builds a [`ExecError::TransientOperator`].
    pub fn transient(operator: impl Into<OperatorId>, message: impl Into<String>) -> Self {
        ExecError::TransientOperator {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Builds a [`ExecError::FatalOperator`].
    pub fn fatal(operator: impl Into<OperatorId>, message: impl Into<String>) -> Self {
        ExecError::FatalOperator {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Builds a [`ExecError::Checkpoint`].
    pub fn checkpoint(operator: impl Into<OperatorId>, message: impl Into<String>) -> Self {
        ExecError::Checkpoint {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Builds a [`ExecError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        ExecError::Configuration(message.into())
    }

    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Configuration(_) => ErrorKind::Configuration,
            ExecError::TransientOperator { .. } => ErrorKind::TransientOperator,
            ExecError::FatalOperator { .. } => ErrorKind::FatalOperator,
            ExecError::Checkpoint { .. } | ExecError::Io(_) | ExecError::Serialization(_) => {
                ErrorKind::Checkpoint
            }
            ExecError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::Configuration(_) => "ConfigurationError",
            ExecError::TransientOperator { .. } => "TransientOperatorError",
            ExecError::FatalOperator { .. } => "FatalOperatorError",
            ExecError::Checkpoint { .. } => "CheckpointError",
            ExecError::Cancelled => "CancellationError",
            ExecError::Io(_) => "CheckpointIo",
            ExecError::Serialization(_) => "CheckpointEncoding",
        }
    }

    /// Operator that originated the error, when known.
    pub fn operator_id(&self) -> Option<&OperatorId> {
        match self {
            ExecError::TransientOperator { operator, .. }
            | ExecError::FatalOperator { operator, .. }
            | ExecError::Checkpoint { operator, .. } => Some(operator),
            _ => None,
        }
    }

    /// Whether the shell may retry the failing step.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::TransientOperator { .. })
    }

    /// Rebuilds an equivalent error; `io::Error` is not `Clone`, so the
    /// parallel engine uses this to report one worker failure to several
    /// listeners.
    pub fn duplicate(&self) -> Self {
        match self {
            ExecError::Configuration(m) => ExecError::Configuration(m.clone()),
            ExecError::TransientOperator { operator, message } => ExecError::TransientOperator {
                operator: operator.clone(),
                message: message.clone(),
            },
            ExecError::FatalOperator { operator, message } => ExecError::FatalOperator {
                operator: operator.clone(),
                message: message.clone(),
            },
            ExecError::Checkpoint { operator, message } => ExecError::Checkpoint {
                operator: operator.clone(),
                message: message.clone(),
            },
            ExecError::Cancelled => ExecError::Cancelled,
            ExecError::Io(err) => ExecError::Io(io::Error::new(err.kind(), err.to_string())),
            ExecError::Serialization(m) => ExecError::Serialization(m.clone()),
        }
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        ExecError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(ExecError::config("x").code(), "ConfigurationError");
        assert_eq!(ExecError::transient("op", "x").code(), "TransientOperatorError");
        assert_eq!(ExecError::fatal("op", "x").code(), "FatalOperatorError");
        assert_eq!(ExecError::checkpoint("op", "x").code(), "CheckpointError");
        assert_eq!(ExecError::Cancelled.code(), "CancellationError");
    }

    #[test]
    fn storage_failures_classify_as_checkpoint() {
        let err = ExecError::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.kind(), ErrorKind::Checkpoint);
        assert!(err.operator_id().is_none());
        let copy = err.duplicate();
        assert!(copy.to_string().contains("disk full"));
    }

    #[test]
    fn operator_id_is_exposed() {
        let err = ExecError::fatal("agg-1", "boom");
        assert_eq!(err.operator_id().map(|o| o.as_str()), Some("agg-1"));
        assert!(!err.is_transient());
        assert!(ExecError::transient("scan", "flaky").is_transient());
    }
}
