//! Retry engine
//!
//! Exponential backoff around unary adapter calls. Whether an error is worth
//! another attempt is the error taxonomy's call
//! ([`GatewayError::is_retryable`]); this module owns the schedule: delay
//! `min(initial * base^n, max)` with optional ±25% jitter, the first attempt
//! not counted as a retry, and the last error re-raised when the budget is
//! exhausted.

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::GatewayError;

/// Delays never drop below this floor, jitter included.
const MIN_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay * self.exponential_base.powi(attempt as i32);
        delay = delay.min(self.max_delay);

        if self.jitter {
            // ±25%
            let offset = delay * 0.25 * (rand::random::<f64>() * 2.0 - 1.0);
            delay += offset;
        }

        Duration::from_secs_f64(delay.max(0.0)).max(MIN_DELAY)
    }
}

/// Run `op` with retries per `policy`. `model_id` labels the diagnostics.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    model_id: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut last_error = match op().await {
        Ok(value) => return Ok(value),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) => e,
    };

    for attempt in 0..policy.max_retries {
        let delay = policy.delay_for(attempt);

        let brief: String = last_error.to_string().chars().take(100).collect();
        tracing::warn!(
            "model {model_id} request failed, retrying in {:.2}s (attempt {}): {brief}",
            delay.as_secs_f64(),
            attempt + 1,
        );

        tokio::time::sleep(delay).await;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}
