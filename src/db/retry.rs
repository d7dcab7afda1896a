//! Retry schedules as plain values.
//!
//! [`RetryPolicy`] drives the transaction coordinator's conflict retries and
//! [`BackoffPolicy`] drives backend connection attempts. Neither sleeps on its
//! own; callers ask for the next delay and await it.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tracing::warn;

/// Conflict retry schedule: one delay per retry, each jittered by `jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
    /// Fraction of each delay added or removed at random (0.5 = ±50 %).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(600),
            ],
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self {
            delays: Vec::new(),
            jitter: 0.0,
        }
    }

    /// Same number of retries as the default schedule, without waiting.
    pub fn immediate() -> Self {
        Self {
            delays: vec![Duration::ZERO; 3],
            jitter: 0.0,
        }
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }

    /// Delay before retry number `retry` (0-based), or `None` once exhausted.
    pub fn delay(&self, retry: usize) -> Option<Duration> {
        let base = *self.delays.get(retry)?;
        if self.jitter <= 0.0 || base.is_zero() {
            return Some(base);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Some(base.mul_f64((1.0 + spread).max(0.0)))
    }
}

/// Exponential backoff for establishing backend connections.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            factor: 1,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the
    /// last error on exhaustion.
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts.max(1) => {
                    counter!("ledgerlink_db.connect.exhausted", 1);
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{} failed, retrying",
                        what
                    );
                    counter!("ledgerlink_db.connect.retry", 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
