//! Retry with exponential backoff for token endpoint calls.

use crate::config::RefreshConfig;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1 is always made)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry
    pub initial_delay: Duration,
    /// Hard cap on the computed delay
    pub max_delay: Duration,
    /// Adds random jitter of [0, initial_delay/2), never exceeding `max_delay`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RefreshConfig::default())
    }
}

impl From<&RefreshConfig> for RetryPolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        // Attempts >= 32 saturate instead of overflowing
        let multiplier = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let capped = self
            .initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `operation` receives the attempt number (1-indexed). Errors for which
    /// `is_retryable` returns false end the loop immediately.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for(attempt - 1);
            warn!(
                attempt,
                max = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// How a retried operation ultimately failed
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// A non-retryable error ended the loop
    Permanent { attempts: u32, error: E },
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last error seen
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Permanent { error, .. } => write!(f, "{}", error),
            RetryError::Exhausted { attempts, error } => {
                write!(f, "gave up after {} attempts: {}", attempts, error)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}
