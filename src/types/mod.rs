#![forbid(unsafe_code)]

//! Shared value model, identifiers and the error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
mod value;

pub use error::{ErrorKind, ExecError, Result};
pub use value::{key_of, row, Row, Value};

/// Identifier of one submitted query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub String);

impl QueryId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        QueryId(value.to_owned())
    }
}

impl From<String> for QueryId {
    fn from(value: String) -> Self {
        QueryId(value)
    }
}

/// Identifier of one operator inside a plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl OperatorId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the id of the task that runs partition `index` of this operator.
    pub fn partition(&self, index: usize) -> OperatorId {
        OperatorId(format!("{}/p{}", self.0, index))
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(value: &str) -> Self {
        OperatorId(value.to_owned())
    }
}

impl From<String> for OperatorId {
    fn from(value: String) -> Self {
        OperatorId(value)
    }
}

impl From<&OperatorId> for OperatorId {
    fn from(value: &OperatorId) -> Self {
        value.clone()
    }
}
