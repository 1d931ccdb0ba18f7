//! Retry strategy with exponential backoff and jitter.
//!
//! Decides whether a failed tool call should be retried and how long to wait,
//! based on the error's category. Retry orchestration lives here rather than
//! in the protocol clients, so a client only ever makes one attempt per call.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{ErrorCategory, McpError};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound for any computed delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (2.0 = double each time).
    pub backoff_multiplier: f64,

    /// Maximum random jitter as a fraction of the delay (0.3 = up to 30%).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay_ms: 1000, max_delay_ms: 30_000, backoff_multiplier: 2.0, jitter_ratio: 0.3 }
    }
}

impl RetryPolicy {
    /// A policy with tiny delays, for tests and local tooling.
    pub fn immediate() -> Self {
        Self { base_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 1.0, jitter_ratio: 0.0 }
    }

    /// Backoff delay for the given 1-based attempt, jitter included.
    ///
    /// The result never exceeds `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay_ms as f64;
        let capped = base.min(max);

        let jittered = if self.jitter_ratio > 0.0 {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..self.jitter_ratio))
        } else {
            capped
        };

        Duration::from_millis(jittered.min(max) as u64)
    }

    /// How long to wait before retrying `error`, or `None` if it must not be
    /// retried.
    ///
    /// A server-requested wait longer than `max_delay_ms` is not honoured;
    /// the rate limit is reported to the caller instead.
    pub fn get_retry_delay(&self, error: &McpError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if error.category() == ErrorCategory::RateLimit {
            if let Some(wait) = error.retry_after() {
                if wait > Duration::from_millis(self.max_delay_ms) {
                    tracing::debug!(
                        service = %error.service(),
                        retry_after_ms = wait.as_millis() as u64,
                        max_delay_ms = self.max_delay_ms,
                        "Rate limit wait exceeds max delay; not retrying"
                    );
                    return None;
                }
                return Some(wait);
            }
        }
        Some(self.delay_for_attempt(attempt))
    }

    /// Whether another attempt should be made after `attempt` attempts.
    pub fn should_retry(&self, error: &McpError, attempt: u32, max_attempts: u32) -> bool {
        should_retry(error, attempt, max_attempts)
    }
}

/// Whether another attempt should be made after `attempt` attempts.
///
/// Configuration errors are never retried, whatever their retryable flag says.
pub fn should_retry(error: &McpError, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    if error.category() == ErrorCategory::Configuration {
        return false;
    }
    error.is_retryable()
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The final result (success or last error).
    pub result: Result<T, McpError>,

    /// Number of attempts made.
    pub attempts: u32,

    /// Total time spent (including delays).
    pub total_time: Duration,

    /// Whether the operation was retried.
    pub was_retried: bool,
}

impl<T> RetryResult<T> {
    /// Check if the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Collapse into a plain result.
    ///
    /// A retryable failure that used up the whole budget is reported as
    /// exhausted rather than as the raw last error.
    pub fn into_result(self, max_attempts: u32) -> Result<T, McpError> {
        match self.result {
            Ok(value) => Ok(value),
            Err(error)
                if error.is_retryable() && self.attempts >= max_attempts && max_attempts > 1 =>
            {
                Err(McpError::retries_exhausted(error, self.attempts))
            }
            Err(error) => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or `max_attempts`
/// attempts have been made.
///
/// The closure receives the 1-based attempt number. Errors are stamped with
/// the attempt they belong to.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let start = Instant::now();
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = operation(attempts).await.map_err(|e| e.with_attempt(attempts));

        let error = match result {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_time: start.elapsed(),
                    was_retried: attempts > 1,
                };
            }
            Err(error) => error,
        };

        let delay = if policy.should_retry(&error, attempts, max_attempts) {
            policy.get_retry_delay(&error, attempts)
        } else {
            None
        };

        let Some(delay) = delay else {
            return RetryResult {
                result: Err(error),
                attempts,
                total_time: start.elapsed(),
                was_retried: attempts > 1,
            };
        };

        tracing::debug!(
            service = %error.service(),
            category = %error.category(),
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying after failure"
        );
        tokio::time::sleep(delay).await;
    }
}
