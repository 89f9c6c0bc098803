use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How the wait between attempts evolves.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Walk the delay schedule; the last entry repeats.
    Fixed,
    /// `delays[0] * factor^n`, capped at `max_delay`.
    Exponential { factor: f64, max_delay: Duration },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
    pub backoff: Backoff,
    /// Fraction (0.0-1.0) of each delay randomly added or removed.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delays: vec![Duration::from_millis(500), Duration::from_millis(1000)],
            backoff: Backoff::Fixed,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
            ..Default::default()
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::fixed(1, Vec::new())
    }

    /// Wait before retry number `retry` (0 = before the second attempt).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = match &self.backoff {
            Backoff::Fixed => self
                .delays
                .get(retry as usize)
                .or_else(|| self.delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
            Backoff::Exponential { factor, max_delay } => {
                let first = self.delays.first().copied().unwrap_or(Duration::ZERO);
                let ms = first.as_millis() as f64 * factor.powi(retry as i32);
                Duration::from_millis(ms.min(max_delay.as_millis() as f64) as u64)
            }
        };
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter_factor.min(1.0);
        let scale = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base.as_millis() as f64 * scale).max(0.0) as u64)
    }
}

/// Runs an async operation under a [`RetryPolicy`].
///
/// Only the last error is returned once attempts run out; earlier failures
/// are logged at `warn`.
#[derive(Clone, Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry every retryable error until attempts are exhausted.
    pub async fn run<T, E, F, Fut>(
        &self,
        op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_cancellable(op, is_retryable, &CancellationToken::new())
            .await
    }

    /// Like [`Self::run`], but a fired `cancel` ends the schedule early and
    /// surfaces the most recent error.
    pub async fn run_cancellable<T, E, F, Fut>(
        &self,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;
            if attempt >= max_attempts || !is_retryable(&err) || cancel.is_cancelled() {
                if attempt > 1 {
                    warn!(attempts = attempt, error = %err, "giving up after retries");
                }
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after error"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
