//! Retry logic with exponential backoff and jitter
//!
//! Used for store transactions that lose an optimistic concurrency race or
//! hit a transient downstream failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};

/// Configuration for retry behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay cap, in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (default: 2.0 for exponential)
    pub backoff_factor: f64,
    /// Whether to add jitter to delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64).max(0.0);
        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

/// Returns true if the error is worth another attempt.
pub fn is_retryable(error: &GapError) -> bool {
    error.is_retryable()
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_retries`.
pub async fn execute_with_retry<F, Fut, T>(mut operation: F, config: &RetryConfig) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt < config.max_retries => {
                let delay = config.delay_for(attempt);
                tracing::debug!(attempt = attempt + 1, ?delay, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
