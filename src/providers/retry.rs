//! Bounded retry with exponential backoff for provider calls.
//!
//! One [`RetryPolicy`] serves every adapter and both call styles: the agent
//! loop wraps a whole batch call, or a whole stream from request to `Done`,
//! in [`RetryPolicy::run`].
//!
//! Only transient failures are retried:
//! - rate limits (429)
//! - server errors (5xx) and provider overload
//! - timeouts and connection failures
//!
//! Auth, billing, bad-request and format errors fail immediately.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ConduitError, Result};

/// Exponential backoff settings for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build from config. A disabled config yields a policy with no retries.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: if config.enabled { config.max_retries } else { 0 },
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `op` receives the zero-based attempt number. Cancellation is honored
    /// both during an attempt and during the backoff sleep, and yields
    /// [`ConduitError::Cancelled`].
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_retryable(&err) || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = compute_delay(attempt, self.base_delay_ms, self.max_delay_ms, jitter_ms(self.base_delay_ms));
            attempt += 1;
            warn!(
                call = label,
                attempt = attempt,
                max_retries = self.max_retries,
                delay_ms = delay,
                error = %err,
                "Retrying provider request after transient error"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
    }
}

/// Whether `err` is worth another attempt.
pub fn is_retryable(err: &ConduitError) -> bool {
    match err {
        ConduitError::ProviderTyped(e) => e.is_retryable(),
        ConduitError::Http(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

/// Backoff delay for a given zero-based retry, capped at `max_delay_ms`.
///
/// `base * 2^attempt + jitter`.
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Jitter in `[0, base)` from the clock's nanosecond component.
fn jitter_ms(base_delay_ms: u64) -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % base_delay_ms.max(1))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }

    #[test]
    fn test_compute_delay() {
        assert_eq!(compute_delay(0, 1000, 30_000, 0), 1000);
        assert_eq!(compute_delay(1, 1000, 30_000, 0), 2000);
        assert_eq!(compute_delay(2, 1000, 30_000, 250), 4250);
        assert_eq!(compute_delay(10, 1000, 30_000, 0), 30_000);
        assert_eq!(compute_delay(64, u64::MAX, u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_jitter_is_below_base() {
        for _ in 0..100 {
            assert!(jitter_ms(7) < 7);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[test]
    fn test_from_config_disabled() {
        let config = RetryConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_retries, 0);
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&ProviderError::RateLimit("429".into()).into()));
        assert!(is_retryable(&ProviderError::Overloaded("busy".into()).into()));
        assert!(!is_retryable(&ProviderError::Auth("401".into()).into()));
        assert!(!is_retryable(&ConduitError::Provider("decode".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_three_times_then_succeeds() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = policy()
            .run("test", &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(ProviderError::RateLimit("429".into()).into())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 plus jitter below 100 each
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(700));
        assert!(waited < Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::ServerError("503".into()).into()) }
            })
            .await;
        assert!(matches!(
            result,
            Err(ConduitError::ProviderTyped(ProviderError::ServerError(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Auth("bad key".into()).into()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<()> = policy()
            .run("test", &cancel, |_| {
                trigger.cancel();
                async { Err(ProviderError::Timeout("slow".into()).into()) }
            })
            .await;
        assert!(matches!(result, Err(ConduitError::Cancelled)));
    }
}
