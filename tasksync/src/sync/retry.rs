use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::provider::ProviderError;

/// Exponential backoff with optional full jitter, bounded by `max_attempts`
/// calls in total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, jitter: bool, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            jitter,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(8),
            true,
            max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Runs one provider call under `timeout`, retrying while the provider
    /// reports itself unavailable. A timeout is returned as is.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => return Err(ProviderError::Timeout(timeout)),
            };
            match result {
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
