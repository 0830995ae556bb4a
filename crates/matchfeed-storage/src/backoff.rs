//! Bounded exponential backoff for calls subject to provider-side throttling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that can tell a rate-limit/quota signal apart from everything else.
pub trait Throttled {
    fn disposition(&self) -> RetryDisposition;
}

/// Only 429 is worth waiting out; other statuses will not heal on a schedule.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay slept after the given 1-based attempt failed: `base * 2^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("{0}")]
    Terminal(E),
    #[error("still rate limited after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> CallError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, CallError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            CallError::Terminal(err) => err,
            CallError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-throttling error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn call_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, op: F) -> Result<T, CallError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Throttled + Display,
{
    call_with_backoff_using(policy, op, tokio::time::sleep).await
}

/// Same as [`call_with_backoff`] with the sleep injected.
pub async fn call_with_backoff_using<T, E, F, Fut, S, SFut>(
    policy: &BackoffPolicy,
    mut op: F,
    mut sleep: S,
) -> Result<T, CallError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Throttled + Display,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.disposition() == RetryDisposition::Retryable => {
                if attempt >= max_attempts {
                    return Err(CallError::Exhausted { attempts: attempt, last: err });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "rate limited; backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(CallError::Terminal(err)),
        }
    }
}
