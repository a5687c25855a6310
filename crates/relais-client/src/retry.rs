//! Retry policy and the bounded retry loop used for first attempts.

use std::future::Future;
use std::time::Duration;

use relais_shared::{ChatError, ChatResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ClientConfig;

/// Decides whether, and after how long, a failed call is attempted again.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` is 1-based: the attempt that just failed.
    fn should_retry(&self, attempt: u32, error: &ChatError) -> bool;

    fn retry_timeout(&self, attempt: u32, error: &ChatError) -> Duration;
}

/// Exponential backoff with a cap, limited to `max_attempts` tries.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl DefaultRetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
    }

    /// Delay after the `attempt`-th failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, attempt: u32, error: &ChatError) -> bool {
        attempt < self.max_attempts && !error.is_permanent()
    }

    fn retry_timeout(&self, attempt: u32, _error: &ChatError) -> Duration {
        self.delay_for_attempt(attempt)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up.
///
/// The last error is returned when giving up. Cancelling `cancel` during a
/// backoff sleep ends the loop with [`ChatError::Cancelled`].
pub async fn run_and_retry<T, F, Fut>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> ChatResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => e,
        };

        if !policy.should_retry(attempt, &error) {
            return Err(error);
        }

        let delay = policy.retry_timeout(attempt, &error);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Request failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
