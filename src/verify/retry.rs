//! Bounded retry with jittered exponential backoff.
//!
//! After the n-th failed attempt the loop waits `b + jitter`, where
//! `b = initial_backoff * 2^(n-1)` and `jitter` is drawn uniformly from
//! `[0, b)`. No wait follows the final attempt. Every wait races a
//! [`CancellationToken`], so an abandoned request stops retrying immediately.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Un-jittered wait after the first failure.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    Exhausted { attempts: u32, last: E },
    /// The token fired; `attempts` had completed by then.
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    /// The un-jittered wait after the `failures`-th failed attempt.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }

    /// `backoff` plus a uniform random jitter in `[0, backoff)`.
    pub fn jittered(backoff: Duration) -> Duration {
        let nanos = u64::try_from(backoff.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return backoff;
        }
        backoff.saturating_add(Duration::from_nanos(rand::rng().random_range(0..nanos)))
    }

    /// Drive `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number. Its error is only used for
    /// logging and for [`RetryError::Exhausted`]; every error is retried.
    pub async fn run<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt - 1 });
                }
                result = op(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => error,
            };

            let wait = Self::jittered(self.backoff(attempt));
            warn!(
                attempt,
                error = %error,
                sleep_ms = wait.as_millis() as u64,
                "request failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
