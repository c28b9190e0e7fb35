//! Bounded retry with exponential backoff.
//!
//! Only transient storage failures are retried. Everything else (outages,
//! invariant violations, malformed input) is returned on the first failure so
//! the caller can route it.

use std::future::Future;
use std::time::Duration;

use strata_core::RetryConfig;

use crate::error::{MergeError, Result};
use crate::metrics;

/// Retry schedule for warehouse operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    /// Total attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }
}

/// Identifies the unit of work being retried, for logs.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Source being merged.
    pub source: &'a str,
    /// Natural key being merged.
    pub natural_key: &'a str,
}

/// Runs `operation`, retrying transient failures per `policy`.
///
/// # Errors
///
/// Returns the first non-transient error unchanged, or
/// [`MergeError::RetriesExhausted`] once every attempt failed transiently.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    ctx: &RetryContext<'_>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        source = ctx.source,
                        natural_key = ctx.natural_key,
                        operation,
                        attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(MergeError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    source = ctx.source,
                    natural_key = ctx.natural_key,
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient storage failure, retrying"
                );
                metrics::record_retry(operation);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
