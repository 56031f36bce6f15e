//! Retry and polling with exponential backoff
//!
//! Every wait in here races against a [`CancellationToken`], so a caller that is
//! shutting down never sits out a backoff delay. Cancellation is reported as its
//! own error variant and is never confused with the operation failing.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Doubling backoff between `initial_delay` and `max_delay`
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Constant interval between attempts
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Why a retried operation did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The operation failed with an error the caller marked as not retryable
    #[error("{0}")]
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The operation's own error, if there was one
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Aborted(e) => Some(e),
        }
    }
}

/// Retry `op` until it succeeds, attempts run out, or `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_if(config, cancel, |_| true, op).await
}

/// Like [`retry_with_backoff`], but stops at the first error for which
/// `is_retryable` returns false.
pub async fn retry_with_backoff_if<T, E, F, Fut, R>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Aborted(err));
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        trace!(attempt, max_attempts, delay = ?delay, "Backing off before next attempt");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = config.next_delay(delay);
    }
}

/// Why a poll did not observe its condition
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("cancelled")]
    Cancelled,

    #[error("condition not met after {attempts} attempts")]
    NotMet { attempts: u32 },

    /// The predicate itself failed; polling stops at the first such failure
    #[error("{0}")]
    Predicate(E),
}

impl<E> PollError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled)
    }
}

enum Probe<E> {
    NotMet,
    Failed(E),
}

/// Poll `predicate` with backoff until it reports `true`.
pub async fn poll_until<E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let result = retry_with_backoff_if(
        config,
        cancel,
        |probe: &Probe<E>| matches!(probe, Probe::NotMet),
        || {
            let check = predicate();
            async move {
                match check.await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Probe::NotMet),
                    Err(e) => Err(Probe::Failed(e)),
                }
            }
        },
    )
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(RetryError::Cancelled) => Err(PollError::Cancelled),
        Err(RetryError::Exhausted {
            last: Probe::Failed(e),
            ..
        })
        | Err(RetryError::Aborted(Probe::Failed(e))) => Err(PollError::Predicate(e)),
        Err(RetryError::Exhausted { attempts, .. }) => Err(PollError::NotMet { attempts }),
        Err(RetryError::Aborted(Probe::NotMet)) => Err(PollError::NotMet {
            attempts: config.max_attempts,
        }),
    }
}
