//! Error types for the bidder

use bidfleet_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Bidder result type
pub type Result<T> = std::result::Result<T, BidderError>;

/// Errors that can occur in the bidder
#[derive(Error, Debug)]
pub enum BidderError {
    /// Marketplace or estimator call failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] CoreError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted fleet state could not be read or written
    #[error("State file {path:?}: {reason}")]
    State {
        /// State file path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Transient failures persisted past the retry budget
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation being retried
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last error observed
        last: CoreError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BidderError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state file error
    pub fn state(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::State {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
