//! Bounded, fixed-delay retry for members-API calls.
//!
//! Deliberately has no backoff or jitter: the clusters this targets are small
//! and the only transient condition worth waiting out is the short window
//! where the raft group is still converging after a topology change.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, ShepherdError};

/// How often and how long to keep retrying a retryable failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. The final error is returned as-is.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = policy.attempts.max(1);
    loop {
        remaining -= 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if remaining > 0 && err.is_retryable() => {
                tracing::warn!(
                    error = %err,
                    delay_secs = policy.delay.as_secs(),
                    remaining,
                    "retrying after transient failure"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
