//! Bounded exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ProviderError;

use super::ProviderResult;

/// Retry schedule for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never waits; for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// or the provider's `Retry-After` when it sent one, capped at
    /// `max_delay` either way.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = error.retry_after().unwrap_or_else(|| {
            let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        backoff.min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails permanently, or the attempt
    /// budget runs out. Returns the number of attempts made with the result.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> (u32, ProviderResult<T>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return (attempt, Ok(value)),
                Err(e) if !e.is_transient() => return (attempt, Err(e)),
                Err(e) if attempt >= max_attempts => {
                    warn!("{label}: giving up after {attempt} attempts: {e}");
                    return (
                        attempt,
                        Err(ProviderError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        }),
                    );
                }
                Err(e) => {
                    let delay = self.delay_for(attempt, &e);
                    debug!(
                        "{label}: attempt {attempt}/{max_attempts} failed ({e}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}
