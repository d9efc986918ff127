//! Retry wrapper for LM calls.
//!
//! Transient provider failures (network errors, 5xx, rate limits) are
//! retried with exponential backoff and jitter. Retries happen inside one
//! node's lifetime and never create additional nodes.

use std::future::Future;
use std::time::Duration;

use super::error::LlmError;

/// Backoff schedule: base interval, growth factor, jitter fraction, and the
/// total number of attempts (1 initial + retries).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Interval before retry number `attempt` (1-based), jittered ±`jitter`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_interval.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((base * (1.0 + spread)).max(0.0))
    }
}

/// Call an LM with automatic retry on transient errors.
///
/// Non-transient errors fail immediately. Exhausting the attempt budget
/// returns the last error.
pub async fn call_with_retry<F, Fut>(
    policy: &RetryPolicy,
    mut call_fn: F,
) -> Result<super::types::CompletionResponse, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<super::types::CompletionResponse, LlmError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call_fn().await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                tracing::warn!(
                    "transient LM error on attempt {}/{}, retrying in {:?}: {}",
                    attempt,
                    policy.max_attempts,
                    wait,
                    e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
