//! Backoff retrier: generic retry wrapper for remote calls.
//!
//! Runs a zero-argument async operation up to `max_attempts` times. Between
//! attempts it sleeps `initial_delay × multiplier^(k−2)` before attempt `k`.
//! Only errors that classify themselves as retryable are retried; cancellation
//! and every other error propagate on first failure.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Classification hook the retrier consults on each failure.
pub trait Retryable {
    /// Transient failure worth another attempt (quota, unavailable).
    fn is_retryable(&self) -> bool;

    /// Explicit cancellation. Never retried, regardless of budget.
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// Retry budget and delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    /// One call plus three retries: 1s, 2s, 4s.
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: u32) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// Delay slept before the 1-based `attempt`. `None` for the first attempt.
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 {
            return None;
        }
        let factor = self.backoff_multiplier.saturating_pow(attempt - 2);
        Some(self.initial_delay.saturating_mul(factor))
    }
}

/// Run `op` under `policy`, retrying transient failures with exponential backoff.
///
/// `label` only feeds the log lines.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if error.is_cancellation() {
            return Err(error);
        }
        if attempt >= max_attempts || !error.is_retryable() {
            if attempt > 1 {
                tracing::warn!(call = label, attempt, error = %error, "Giving up after retries");
            }
            return Err(error);
        }

        attempt += 1;
        let delay = policy.delay_before_attempt(attempt).unwrap_or_default();
        tracing::warn!(
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
