//! Retry logic with exponential backoff for handling transient failures.
//!
//! Every call to an unreliable dependency (cache, broker, ledger) goes
//! through [`RetryExecutor::run`]. The loop is explicit: an attempt counter,
//! a predicate deciding whether an error is worth retrying, and an injected
//! [`Sleeper`] so the wait never blocks other work and tests can observe it.
//!
//! # Schedule
//!
//! Attempts are numbered from 1. After a failed attempt `n` the executor
//! waits `base_delay * multiplier^(n-1)`, capped at `max_delay`, so with the
//! defaults the waits are 100ms, 200ms, 400ms, ...
//!
//! # Example
//!
//! ```rust
//! use steadfast_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let result = retry_with_backoff(&policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;
use steadfast_core::environment::{Sleeper, TokioSleeper};

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (the first call plus two retries)
/// - `base_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Uses exponential backoff: `base_delay * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicyBuilder {
    /// Set total attempts. Values below 1 are raised to 1.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Set the wait after the first failure.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor<S = TokioSleeper> {
    sleeper: S,
}

impl<S: Sleeper> RetryExecutor<S> {
    /// Create an executor that waits through `sleeper`.
    #[must_use]
    pub const fn new(sleeper: S) -> Self {
        Self { sleeper }
    }

    /// Run `operation` until it succeeds, `should_retry` rejects its error,
    /// or `policy.max_attempts` attempts have been made.
    ///
    /// Success is never retried. On giving up, the error of the last
    /// attempt is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<F, Fut, T, E, P>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Operation succeeded after retry");
                        RetryMetrics::record_success();
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        tracing::warn!(
                            attempt,
                            error = %err,
                            "Error is not retryable, failing immediately"
                        );
                        return Err(err);
                    }

                    if attempt >= policy.max_attempts {
                        tracing::error!(
                            attempt,
                            error = %err,
                            "Operation failed after max attempts"
                        );
                        RetryMetrics::record_exhausted();
                        return Err(err);
                    }

                    let delay = policy.delay_after_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation failed, retrying..."
                    );
                    RetryMetrics::record_attempt();

                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Retry an async operation with exponential backoff, retrying every error.
///
/// # Errors
///
/// Returns the last error if all attempts fail.
///
/// # Example
///
/// ```rust
/// use steadfast_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_backoff(&RetryPolicy::default(), || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    RetryExecutor::new(TokioSleeper)
        .run(policy, operation, |_| true)
        .await
}

/// Retry an async operation, consulting `is_retryable` on each error.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts
/// are exhausted.
///
/// # Example
///
/// ```rust
/// use steadfast_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_predicate(
///     &RetryPolicy::default(),
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    RetryExecutor::new(TokioSleeper)
        .run(policy, operation, is_retryable)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use steadfast_testing::RecordingSleeper;

    fn failing_until(
        counter: &Arc<AtomicU32>,
        successes_from: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, String>> + '_ {
        move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if attempt < successes_from {
                Err(format!("attempt {attempt} failed"))
            } else {
                Ok(attempt)
            })
        }
    }

    #[test]
    fn test_delay_schedule_doubles_from_base() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_after_attempt(6), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::builder().max_attempts(0).build().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_first_try_without_waiting() {
        let sleeper = RecordingSleeper::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result = RetryExecutor::new(sleeper.clone())
            .run(&RetryPolicy::default(), failing_until(&counter, 1), |_| true)
            .await;

        assert_eq!(result, Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_two_failures_then_success_waits_100_then_200() {
        let sleeper = RecordingSleeper::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result = RetryExecutor::new(sleeper.clone())
            .run(&RetryPolicy::default(), failing_until(&counter, 3), |_| true)
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_sleeper_elapses_at_least_300ms() {
        let counter = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(&RetryPolicy::default(), failing_until(&counter, 3)).await;

        assert_eq!(result, Ok(3));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error_verbatim() {
        let sleeper = RecordingSleeper::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result = RetryExecutor::new(sleeper.clone())
            .run(&RetryPolicy::default(), failing_until(&counter, u32::MAX), |_| true)
            .await;

        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let sleeper = RecordingSleeper::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result = RetryExecutor::new(sleeper.clone())
            .run(&RetryPolicy::default(), failing_until(&counter, u32::MAX), |err: &String| {
                err.contains("transient")
            })
            .await;

        assert_eq!(result, Err("attempt 1 failed".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::builder().max_attempts(1).build();

        let result = retry_with_predicate(&policy, failing_until(&counter, 2), |_| true).await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_delays_are_monotonic_and_capped(
            base_ms in 1u64..1_000,
            max_ms in 1u64..60_000,
            attempts in 1u32..20,
        ) {
            let policy = RetryPolicy::builder()
                .base_delay(Duration::from_millis(base_ms))
                .max_delay(Duration::from_millis(max_ms))
                .build();

            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_after_attempt(attempt);
                prop_assert!(delay <= Duration::from_millis(max_ms));
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
