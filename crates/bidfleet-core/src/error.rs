//! Error types for bidfleet collaborators

use thiserror::Error;

/// Error raised by a marketplace or estimator call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Upstream gateway error or malformed payload; worth retrying
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// The marketplace command itself failed
    #[error("Command failed: {0}")]
    Command(String),

    /// Response had an unexpected shape
    #[error("Unexpected response: {0}")]
    Parse(String),

    /// Throughput service error
    #[error("Estimator error: {0}")]
    Estimator(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Whether a retry with the same input may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}
