//! Bounded retries and per-call deadlines.

use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Runs `fut` under a deadline. Elapsed deadlines become retryable
/// `Error::Timeout`s so a stuck call can never stall a reconciliation tick.
pub async fn bounded<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            op,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// Adds up to a quarter of the delay at random, spreading out members
    /// that failed at the same moment.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            multiplier: 2,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            initial,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0 is the first retry), jitter excluded.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn sleep_time(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(0);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Calls `f` until it succeeds, returns an error `should_retry` rejects, or
    /// attempts run out. `f` receives the zero-based attempt number.
    pub async fn retry_if<T, F, Fut, P>(&self, op: &'static str, should_retry: P, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < attempts && should_retry(&e) => {
                    let delay = self.sleep_time(attempt);
                    debug!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn retry<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_if(op, Error::is_retryable, f).await
    }
}
