//! Exponential backoff for rate-limited upstream calls.
//!
//! Transport failures and 5xx responses are re-sent inside [`crate::AssistantsClient`]; this
//! policy only covers responses the upstream marked as rate limited.

use std::future::Future;
use std::time::Duration;

use crate::AssistantsError;

pub const DEFAULT_RATE_LIMIT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RATE_LIMIT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RATE_LIMIT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RATE_LIMIT_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Retries after the first call; `0` disables retrying.
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RATE_LIMIT_BASE_DELAY_MS),
            multiplier: DEFAULT_RATE_LIMIT_MULTIPLIER,
            max_retries: DEFAULT_RATE_LIMIT_MAX_RETRIES,
            max_delay: Duration::from_millis(DEFAULT_RATE_LIMIT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails with anything other than a rate limit, or the retry
    /// budget is spent. The last rate-limit error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, AssistantsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AssistantsError>>,
    {
        let mut retries = 0_u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_rate_limited() && retries < self.max_retries => {
                    let hinted = error.retry_after().unwrap_or_default();
                    let wait = self.delay_for(retries).max(hinted).min(self.max_delay);
                    retries += 1;
                    tracing::warn!(
                        target: "assistants_client::retry",
                        operation,
                        attempt = retries,
                        max_retries = self.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "upstream rate limited; backing off",
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(error) => {
                    if error.is_rate_limited() {
                        tracing::warn!(
                            target: "assistants_client::retry",
                            operation,
                            retries,
                            "rate limit retries exhausted",
                        );
                    }
                    return Err(error);
                }
            }
        }
    }
}
