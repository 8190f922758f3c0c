//! Retry with exponential backoff for catalog and manifest calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use flurry_core::emit;

use crate::error::{ErrorClass, Retryable};
use crate::metrics::events::RetryAttempted;

/// How failed calls are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Deadline for each attempt.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    ///
    /// Doubles per retry up to `max_delay`, then picks a point in the upper
    /// half of that window.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms < 2 {
            return ceiling;
        }
        let half = ceiling_ms / 2;
        Duration::from_millis(half + rand::rng().random_range(0..=half))
    }

    /// Run `attempt` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// Transient failures sleep for [`backoff`](Self::backoff) first. An
    /// expired token is retried at once; the attempt itself is expected to
    /// have dropped the stale token.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        target: &str,
        mut attempt: F,
    ) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            let result = match tokio::time::timeout(self.request_timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, self.request_timeout)),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let reason = match err.class() {
                ErrorClass::Permanent => return Err(err),
                ErrorClass::Transient => "transient",
                ErrorClass::AuthExpired => "auth_expired",
            };
            if tries >= max_attempts {
                warn!(target = %target, operation, attempts = tries, error = %err, "Retries exhausted");
                return Err(err);
            }

            emit!(RetryAttempted {
                operation,
                reason,
                target: target.to_string(),
            });

            if err.class() == ErrorClass::Transient {
                let delay = self.backoff(tries);
                warn!(
                    target = %target,
                    operation,
                    attempt = tries,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(target = %target, operation, attempt = tries, "Access token expired, re-authenticating");
            }
        }
    }
}
