//! Exponential backoff for transient platform errors.
//!
//! Only errors for which [`MigrationError::is_transient`] holds are retried;
//! credential and client errors surface on the first attempt.

use crate::error::MigrationError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` tries starting at `initial_delay`.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Pause after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let Some(exponent) = failures.checked_sub(1) else {
            return Duration::ZERO;
        };
        let factor = self.multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let pause = Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        if self.jitter {
            pause.mul_f64(1.0 + rand::random::<f64>() / 4.0)
        } else {
            pause
        }
    }

    /// Run `operation`, retrying transient errors up to `max_attempts`.
    ///
    /// Non-transient errors are returned immediately.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MigrationError>>,
    {
        self.execute_until(None, operation).await
    }

    /// Like [`execute`](Self::execute), but gives up instead of sleeping past `deadline`.
    ///
    /// A rate limit with a known reset time waits at least that long.
    pub async fn execute_until<F, Fut, T>(
        &self,
        deadline: Option<Instant>,
        mut operation: F,
    ) -> Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MigrationError>>,
    {
        let mut failures = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };
            failures += 1;

            if failures >= self.max_attempts {
                tracing::warn!(attempts = failures, error = %error, "Giving up after transient errors");
                return Err(error);
            }

            let mut pause = self.backoff(failures);
            if let MigrationError::RateLimitExceeded(secs) = &error {
                pause = pause.max(Duration::from_secs(*secs));
            }
            let resume_at = Instant::now() + pause;
            if deadline.is_some_and(|deadline| resume_at >= deadline) {
                return Err(error);
            }

            tracing::debug!(
                attempt = failures,
                pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Transient error, trying again"
            );
            tokio::time::sleep_until(resume_at).await;
        }
    }
}
