//! Error types shared by the compiler, the executor and the drivers.

use std::fmt;

use thiserror::Error;

/// A failure reported by a database driver, carrying its message and, when
/// the driver has one, its error code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverError {
    pub message: String,
    pub code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid parameter '{name}': {reason}")]
    ParameterBinding { name: String, reason: String },

    #[error("Failed to connect: {0}")]
    Connection(#[source] DriverError),

    #[error("Query execution failed: {0}")]
    QueryExecution(#[source] DriverError),

    /// Only ever logged; the executor never returns it.
    #[error("Failed to release connection: {0}")]
    ConnectionRelease(#[source] DriverError),
}

impl QueryError {
    pub(crate) fn binding(name: &str, reason: impl Into<String>) -> Self {
        QueryError::ParameterBinding {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// The driver error behind this failure, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            QueryError::ParameterBinding { .. } => None,
            QueryError::Connection(err)
            | QueryError::QueryExecution(err)
            | QueryError::ConnectionRelease(err) => Some(err),
        }
    }
}
