//! Bounded retry for one-shot async operations
//!
//! Used where a fixed number of attempts is wanted before handing the failure
//! to the circuit breaker, e.g. the consumer-group pass at engine start.

use crate::core::config::StartupSettings;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl From<&StartupSettings> for RetryPolicy {
    fn from(settings: &StartupSettings) -> Self {
        Self {
            max_attempts: settings.ensure_attempts.max(1),
            delay: Duration::from_millis(settings.ensure_retry_delay_ms),
        }
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects an error, or attempts run out
///
/// Returns the last error when every attempt failed.
pub async fn retry_async<F, T, E, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if attempt < max_attempts && should_retry(&error) => {
                log::debug!(
                    "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                    operation_name,
                    attempt,
                    max_attempts,
                    policy.delay,
                    error
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = retry_async("create_group", &quick_policy(3), |_| true, || async {
            Ok::<i32, String>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result = retry_async("create_group", &quick_policy(3), |_| true, || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result = retry_async("create_group", &quick_policy(2), |_| true, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, &str>("connection refused")
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "connection refused");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_at_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result = retry_async(
            "create_group",
            &quick_policy(5),
            |e: &&str| *e != "fatal",
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), &str>("fatal")
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_from_startup_settings() {
        let policy = RetryPolicy::from(&StartupSettings {
            ensure_attempts: 0,
            ensure_retry_delay_ms: 250,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }
}
