//! Retry with exponential backoff and jitter.
//!
//! Wraps arbitrary async operations in bounded retry. Delays grow
//! exponentially per attempt until capped; jitter spreads concurrent
//! retries apart. After exhaustion the last error is returned unchanged,
//! so callers see the operation's own error type and message rather
//! than a wrapper.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter factor.
    #[must_use]
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Computes the backoff delay before retry number `attempt` (1-based).
    ///
    /// The raw delay is `base * 2^(attempt-1)` capped at `max_delay_ms`,
    /// then scaled by `1 ± jitter_factor`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let raw = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms);

        if self.jitter_factor <= 0.0 || raw == 0 {
            return Duration::from_millis(raw);
        }

        let spread = self.jitter_factor.min(1.0);
        let scale = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(((raw as f64) * scale).max(0.0) as u64)
    }
}

/// Executes `operation` with bounded retry and backoff.
///
/// On success returns immediately with no delay. On error, sleeps the
/// configured backoff and retries until `max_attempts` is exhausted,
/// then returns the last error as-is.
///
/// # Errors
///
/// Returns the operation's final error after all attempts fail.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let delay = config.backoff_delay(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("loop returns on the final attempt")
}
