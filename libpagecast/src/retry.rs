//! Bounded-attempt retry with a fixed delay
//!
//! The delay is constant rather than exponential: the publishing surface
//! recovers on a roughly fixed schedule, so backing off further only delays
//! the post. Errors that retrying cannot fix (see
//! [`PublishError::is_retryable`]) are returned on the first attempt.

use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::PublishError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    /// A policy that runs the operation once
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The last error is returned.
    pub async fn execute<T, F, Fut>(&self, step: &str, mut operation: F) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(step, attempt, "Step succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !self.should_retry(step, attempt, &e) {
                        return Err(e);
                    }
                    attempt += 1;
                    sleep(self.base_delay).await;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) for operations that need `&mut` access
    /// to a target between attempts, such as a session.
    pub async fn execute_on<S, T, F>(
        &self,
        step: &str,
        target: &mut S,
        mut operation: F,
    ) -> Result<T, PublishError>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, PublishError>>,
    {
        let mut attempt = 1;
        loop {
            match operation(&mut *target).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry(step, attempt, &e) {
                        return Err(e);
                    }
                    attempt += 1;
                    sleep(self.base_delay).await;
                }
            }
        }
    }

    fn should_retry(&self, step: &str, attempt: u32, error: &PublishError) -> bool {
        if !error.is_retryable() {
            debug!(step, kind = error.kind(), "Error is not retryable, escalating");
            return false;
        }
        if attempt >= self.max_attempts {
            warn!(
                step,
                attempts = self.max_attempts,
                "Giving up after {} attempts: {}",
                self.max_attempts,
                error
            );
            return false;
        }
        warn!(
            step,
            attempt,
            max_attempts = self.max_attempts,
            "Transient failure: {}. Retrying in {}ms...",
            error,
            self.base_delay.as_millis()
        );
        true
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds_within_three_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = fast(3)
            .execute("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(PublishError::TransientSurfaceError(format!("attempt {}", n)))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = fast(3)
            .execute("always-fails", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(PublishError::ConfirmFailed(format!("attempt {}", n)))
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            PublishError::ConfirmFailed("attempt 3".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_escalates_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = fast(5)
            .execute("denied", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PublishError::AccessDenied("no admin controls".to_string()))
            })
            .await;

        assert!(matches!(result, Err(PublishError::AccessDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waits_base_delay_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let start = std::time::Instant::now();
        let _: Result<(), _> = policy
            .execute("slow", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PublishError::TransientSurfaceError("timeout".to_string()))
            })
            .await;

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_on_mutates_target_between_attempts() {
        let mut counter = 0u32;

        let result = fast(3)
            .execute_on("count", &mut counter, |c| {
                Box::pin(async move {
                    *c += 1;
                    if *c < 2 {
                        Err(PublishError::ComposeFailed("not yet".to_string()))
                    } else {
                        Ok(*c)
                    }
                })
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter, 2);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 4,
            base_delay_ms: 250,
        });
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.base_delay(), Duration::from_millis(250));
    }
}
