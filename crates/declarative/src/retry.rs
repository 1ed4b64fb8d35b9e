//! Bounded retry with exponential backoff for transient provider errors.

use crate::provider::ProviderError;
use std::thread;
use std::time::Duration;

/// Retry policy for provider calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(60),
        }
    }

    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Result of a retried operation together with the number of attempts made
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`ProviderError::is_retryable`] errors are retried.
pub fn with_retry<T, F>(policy: &RetryPolicy, resource: &str, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation() {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                log::warn!(
                    "{resource}: attempt {attempt}/{max_attempts} failed: {e}. Retrying in {}ms",
                    delay.as_millis()
                );
                thread::sleep(delay);
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}
