//! Retry policy for query fetches.
//!
//! [`with_retry`] wraps a fetch with automatic retry on retryable errors
//! (network failures and HTTP failure statuses). Wallet, validation and
//! session errors are returned immediately.
//!
//! # Backoff Strategy
//!
//! The delay before retry `n` (zero-based) is `initial_backoff * multiplier^n`,
//! capped at `max_backoff`.

use folio_core::{FolioError, FolioResult};
use std::future::Future;
use std::time::Duration;

/// Bounded retry policy. The default performs no retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Retry up to `max_retries` times with the default backoff.
    pub fn attempts(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Whether the attempt numbered `attempt` (zero-based) may be followed by
    /// another one after failing with `err`.
    pub fn permits(&self, attempt: u32, err: &FolioError) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }

    /// Delay before the retry that follows attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Execute `operation`, retrying while `policy` permits.
///
/// Returns the first success, or the error of the last attempt.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> FolioResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FolioResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "fetch succeeded after retry",
                    );
                }
                return Ok(value);
            }
            Err(err) if policy.permits(attempt, &err) => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::attempts(max_retries)
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350))
            .with_multiplier(2.0);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_default_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.permits(0, &FolioError::network("down")));
    }

    #[tokio::test]
    async fn test_retries_network_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), "book", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FolioError::network("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: FolioResult<()> = with_retry(&fast(2), "book", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FolioError::http(503, None)) }
        })
        .await;
        assert_eq!(result, Err(FolioError::http(503, None)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wallet_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: FolioResult<()> = with_retry(&fast(5), "sign", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FolioError::wallet("User rejected the request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
