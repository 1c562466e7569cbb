//! Retry-with-backoff combinator for calls to external services
//!
//! Only transient errors (see [`FulfillmentError::is_transient`]) are retried.
//! Anything else is returned after the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::FulfillmentError;

/// Successful outcome of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Number of failed attempts before the success
    pub retries: u32,
}

/// Final failure after all attempts were used
#[derive(Debug)]
pub struct Exhausted {
    pub error: FulfillmentError,
    pub attempts: u32,
}

/// Attempts and delay schedule for [`with_retry`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the n-th failure is `base^n` seconds
    pub base_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_secs: 2 }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_secs: u64) -> Self {
        Self { attempts, base_secs }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_secs.saturating_pow(attempt))
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<Retried<T>, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FulfillmentError>>,
    {
        let policy = *self;
        with_retry(op, self.attempts, move |attempt| policy.backoff(attempt)).await
    }
}

/// Run `op` up to `attempts` times, sleeping `backoff(n)` after the n-th failure.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut, B>(mut op: F, attempts: u32, backoff: B) -> Result<Retried<T>, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FulfillmentError>>,
    B: Fn(u32) -> Duration,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt - 1,
                })
            }
            Err(error) => {
                if attempt >= attempts || !error.is_transient() {
                    return Err(Exhausted { error, attempts: attempt });
                }
                let delay = backoff(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
