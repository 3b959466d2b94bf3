//! Bounded retry for transient marketplace failures
//!
//! Gateway errors and malformed payloads from the marketplace are usually gone
//! a few seconds later. They are retried synchronously with a fixed delay; any
//! other error is returned immediately. After `max_attempts` the last error is
//! surfaced as [`BidderError::RetriesExhausted`] so the caller can degrade.

use crate::error::{BidderError, Result};
use bidfleet_core::CoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub delay: Duration,

    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a retry policy
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    /// Run `op`, retrying transient failures
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(BidderError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last: e,
                        });
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Marketplace call failed, retrying in {:?}",
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 20)
    }
}
