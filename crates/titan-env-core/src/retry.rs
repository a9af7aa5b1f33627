//! Bounded retry and polling.
//!
//! Every stage that waits on an asynchronous collaborator goes through one
//! of these two combinators, so attempt counting and sleeping live here and
//! nowhere else.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(n-1)` for the n-th retry, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let shift = retry.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; treated as at least 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(5),
                max: Duration::from_secs(30),
            },
        }
    }
}

/// Successful result and the attempt it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// Last error once retrying stops.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// `true` when the ceiling was hit, `false` when the error was not retryable
    pub exhausted: bool,
}

/// Run `action` until it succeeds, returns a non-retryable error, or the
/// attempt ceiling is reached.
///
/// Between a failed attempt and the next one the backoff delay elapses and
/// then `on_retry(failed_attempt)` runs, so cleanup before a retry happens
/// exactly once per retry.
pub async fn with_retry<T, E, A, AFut, H, HFut, R>(
    policy: &RetryPolicy,
    is_retryable: R,
    mut on_retry: H,
    mut action: A,
) -> Result<RetryOutcome<T>, RetryFailure<E>>
where
    A: FnMut(u32) -> AFut,
    AFut: Future<Output = Result<T, E>>,
    H: FnMut(u32) -> HFut,
    HFut: Future<Output = ()>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match action(attempt).await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) => {
                let retryable = is_retryable(&error);
                if !retryable || attempt >= max_attempts {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: retryable,
                    });
                }

                let delay = policy.backoff.delay(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                on_retry(attempt).await;
                attempt += 1;
            }
        }
    }
}

/// Bounded polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_polls: u32,
    pub interval: Duration,
}

/// Call `check(poll)` until it returns `true`, sleeping `interval` between
/// calls. Returns the number of polls used, or `None` if the bound ran out.
pub async fn poll_until<F, Fut>(policy: &PollPolicy, mut check: F) -> Option<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for poll in 1..=policy.max_polls {
        if check(poll).await {
            return Some(poll);
        }
        debug!(poll, max_polls = policy.max_polls, "Condition not met yet");
        if poll < policy.max_polls {
            tokio::time::sleep(policy.interval).await;
        }
    }
    None
}
