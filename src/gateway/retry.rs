//! Bounded exponential-backoff retry around a single external call.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::error::ProviderError;

/// Extra wait added on top of a provider-supplied rate-limit reset hint.
pub const RESET_HINT_MARGIN: Duration = Duration::from_secs(5);

/// Which errors the policy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryOn {
    /// Every error is treated as transient.
    #[default]
    AnyError,
    /// Only errors whose `is_retryable()` is true.
    Transient,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub retry_on: RetryOn,
    /// Honour `X-RateLimit-Reset` style hints carried by rate-limit errors.
    pub honour_reset_hint: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::model_call()
    }
}

impl RetryPolicy {
    /// Essay generation calls: 5 attempts, 3s .. 30s.
    pub fn model_call() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            retry_on: RetryOn::AnyError,
            honour_reset_hint: true,
        }
    }

    /// Judge calls: 5 attempts, 5s .. 60s.
    pub fn judge_call() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            retry_on: RetryOn::AnyError,
            honour_reset_hint: true,
        }
    }

    /// No waiting between attempts; for tests and offline runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on: RetryOn::AnyError,
            honour_reset_hint: false,
        }
    }

    pub fn should_retry(&self, err: &ProviderError) -> bool {
        match self.retry_on {
            RetryOn::AnyError => true,
            RetryOn::Transient => err.is_retryable(),
        }
    }

    /// Backoff before attempt `attempt + 1` (0-based), doubling and clamped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.min(16));
        let delay = Duration::from_secs(1).saturating_mul(multiplier);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Delay before the next attempt after `err`.
    fn delay_after(&self, err: &ProviderError, attempt: u32) -> Duration {
        let backoff = self.backoff_delay(attempt);
        match err.reset_hint() {
            Some(hint) if self.honour_reset_hint => backoff.max(hint + RESET_HINT_MARGIN),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, the error is not retryable, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 >= attempts || !self.should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_after(&err, attempt);
                    warn!(
                        call = label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        code = err.code(),
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_within_bounds() {
        let p = RetryPolicy::model_call();
        assert_eq!(p.backoff_delay(0), Duration::from_secs(3));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(p.backoff_delay(10), Duration::from_secs(30));

        let j = RetryPolicy::judge_call();
        assert_eq!(j.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(j.backoff_delay(5), Duration::from_secs(32));
        assert_eq!(j.backoff_delay(6), Duration::from_secs(60));
    }

    #[test]
    fn reset_hint_extends_delay() {
        let p = RetryPolicy::model_call();
        let err = ProviderError::rate_limited(
            Some(Duration::from_secs(40)),
            crate::gateway::ErrorContext::new().with_status(429),
        );
        assert_eq!(p.delay_after(&err, 0), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::config("nope")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn transient_policy_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            retry_on: RetryOn::Transient,
            ..RetryPolicy::immediate(5)
        };
        let result: Result<(), _> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::invalid_request("bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let value = RetryPolicy::immediate(5)
            .run("test", |attempt| async move {
                if attempt < 2 {
                    Err(ProviderError::provider("openai_compat", "503", true))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
