//! Bounded retry with exponential backoff.

use std::{future::Future, time::Duration};

use tracing::debug;

use crate::document_store::DocumentStoreError;

/// Attempt budget and delay schedule for one retried operation.
///
/// The delay after failed attempt `n` (1-based) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay }
    }

    /// Budget for optimistic-concurrency conflicts: 3 attempts from 0.2s.
    pub const fn conflicts() -> Self {
        Self::new(3, Duration::from_millis(200))
    }

    /// Budget for chart API calls: 3 attempts from 0.5s.
    pub const fn chart_fetch() -> Self {
        Self::new(3, Duration::from_millis(500))
    }

    /// Same attempt budget, no sleeping. Used by tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor)
    }

    /// Sleeps for [`RetryPolicy::delay_for`], skipping the timer entirely for zero delays.
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflicts()
    }
}

/// Runs `operation` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent.
///
/// Each attempt is expected to re-read whatever it conditions its write on.
/// On exhaustion the last conflict error is returned, so callers can turn it
/// into a soft outcome with [`DocumentStoreError::is_conflict`].
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, operation_name: &str, mut operation: F) -> Result<T, DocumentStoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DocumentStoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_conflict() && attempt < max_attempts => {
                debug!(operation = operation_name, attempt, error = %error, "conflict_retry");
                policy.backoff(attempt).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::DocumentKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::conflicts();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(RetryPolicy::chart_fetch().delay_for(2), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let key = DocumentKey::new("flow_runs", "run-1");

        let result: Result<(), _> = retry_on_conflict(RetryPolicy::immediate(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let error = DocumentStoreError::precondition_failed(&key);
            async move { Err(error) }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_on_conflict(RetryPolicy::immediate(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DocumentStoreError::backend("unavailable")) }
        })
        .await;

        assert!(!result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_a_conflict() {
        let key = DocumentKey::new("flow_runs", "run-1");
        let result = retry_on_conflict(RetryPolicy::immediate(3), "test", |attempt| {
            let outcome = if attempt == 1 {
                Err(DocumentStoreError::aborted(&key, "contention"))
            } else {
                Ok(attempt)
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }
}
