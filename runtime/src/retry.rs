//! Retry logic with exponential backoff for handling transient failures.
//!
//! The policy counts **total attempts**: `max_attempts = 1` calls the operation once and
//! never retries. Delays grow as `initial_delay * multiplier^(attempt - 1)` and are capped
//! at `max_delay`; the multiplier is clamped to at least `1.0`, so the sequence of delays
//! is non-decreasing and bounded whatever the inputs.
//!
//! # Example
//!
//! ```rust
//! use drainpipe_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let result = retry_with_backoff(&policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const MAX_GROWTH_STEPS: usize = 1024;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of calls, including the first one
    pub max_attempts: usize,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Policy that calls the operation once and never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Number of calls this policy allows (at least one).
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Uses exponential backoff: `initial_delay * multiplier^(attempt - 1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let initial = self.initial_delay.min(self.max_delay);
        if attempt <= 1 {
            return initial;
        }

        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };

        #[allow(clippy::cast_precision_loss)]
        let max_ns = self.max_delay.as_nanos() as f64;
        #[allow(clippy::cast_precision_loss)]
        let mut delay_ns = initial.as_nanos() as f64;

        // Step by step rather than `powi` so each step is monotonic under rounding.
        // Past MAX_GROWTH_STEPS the delay stops growing.
        for _ in 1..attempt.min(MAX_GROWTH_STEPS) {
            delay_ns *= multiplier;
            if delay_ns >= max_ns || delay_ns == 0.0 {
                break;
            }
        }

        if delay_ns >= max_ns {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ns = delay_ns as u64;
        Duration::from_nanos(delay_ns)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of calls (values below 1 are treated as 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failed attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff (values below 1.0 are treated as 1.0).
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Why a cancellable retry gave up.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E: fmt::Display> {
    /// Every allowed attempt failed
    #[error("failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Calls made
        attempts: usize,
        /// Error from the final call
        last_error: E,
    },

    /// Cancellation was observed between attempts
    #[error("cancelled after {attempts} attempts: {last_error}")]
    Cancelled {
        /// Calls made before cancellation
        attempts: usize,
        /// Error from the last call made
        last_error: E,
    },
}

impl<E: fmt::Display> RetryError<E> {
    /// Calls made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Error from the last call made.
    #[must_use]
    pub const fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } | Self::Cancelled { last_error, .. } => last_error,
        }
    }

    /// Consume and return the last error.
    #[must_use]
    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } | Self::Cancelled { last_error, .. } => last_error,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `operation` - Async operation to retry (must be `FnMut` to allow multiple calls)
///
/// # Errors
///
/// Returns the error of the last call if all `policy.max_attempts` calls fail.
///
/// # Example
///
/// ```rust
/// use drainpipe_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(&policy, || async {
///     // Simulated fallible operation
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
    E: fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation with custom retry logic.
///
/// This function allows you to provide a predicate to determine whether
/// an error is retryable.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the last call if all
/// attempts fail.
///
/// # Example
///
/// ```rust
/// use drainpipe_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_predicate(
///     &policy,
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if attempt >= max_attempts {
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry an async operation, stopping early when `cancel` fires.
///
/// Cancellation is only observed between attempts: a call that is already running is
/// allowed to finish. If the token fires during a backoff sleep, the sleep is cut short
/// and no further call is made.
///
/// # Errors
///
/// - [`RetryError::Exhausted`] if every allowed call failed.
/// - [`RetryError::Cancelled`] if cancellation was observed after a failed call.
pub async fn retry_with_cancellation<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        let err = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis(),
            error = %err,
            "Attempt failed, backing off"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error: err,
                });
            }
            () = sleep(delay) => {}
        }

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last_error: err,
            });
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delays_double_from_the_initial_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn delays_are_capped_at_max_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(2));
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(500))
            .multiplier(0.1)
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_means_one_call() {
        let policy = RetryPolicy::builder().max_attempts(0).build();
        assert_eq!(policy.attempts(), 1);
    }

    proptest! {
        #[test]
        fn delays_are_non_decreasing_and_bounded(
            initial_ms in 0u64..10_000,
            max_ms in 0u64..120_000,
            multiplier in -4.0f64..16.0,
            attempts in 1usize..64,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(max_ms))
                .multiplier(multiplier)
                .build();

            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    /// Operation failing `failures` times with "broker unavailable", then yielding the
    /// call count.
    fn flaky(failures: usize) -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<Result<usize, String>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let operation = move || {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(format!("broker unavailable (call {n})"))
            } else {
                Ok(n)
            })
        };
        (calls, operation)
    }

    #[tokio::test]
    async fn first_success_returns_without_retrying() {
        let (calls, operation) = flaky(0);

        let result = retry_with_backoff(&RetryPolicy::default(), operation).await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(10))
            .build();
        let (calls, operation) = flaky(2);

        let result = retry_with_backoff(&policy, operation).await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_return_the_last_error() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(10))
            .build();
        let (calls, operation) = flaky(usize::MAX);

        let result = retry_with_backoff(&policy, operation).await;

        assert_eq!(result, Err("broker unavailable (call 3)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy::no_retry();
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(&policy, || async { Err::<(), _>("nope") }).await;

        assert_eq!(result, Err("nope"));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn predicate_rejection_fails_on_first_call() {
        let (calls, operation) = flaky(usize::MAX);

        let result = retry_with_predicate(&RetryPolicy::default(), operation, |err: &String| {
            err.starts_with("timeout")
        })
        .await;

        assert_eq!(result, Err("broker unavailable (call 1)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observed_sleeps_follow_the_policy() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_millis(100))
            .multiplier(3.0)
            .max_delay(Duration::from_secs(1))
            .build();

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_clone = Arc::clone(&calls);
        let started = tokio::time::Instant::now();

        let result = retry_with_cancellation(&policy, &CancellationToken::new(), |attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if let Ok(mut calls) = calls.lock() {
                    calls.push((attempt, started.elapsed()));
                }
                Err::<(), _>("down")
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5, .. })));

        let calls = calls.lock().map(|c| c.clone()).unwrap_or_default();
        let offsets: Vec<Duration> = calls.iter().map(|(_, at)| *at).collect();
        assert_eq!(calls.len(), 5);
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_millis(1300),
                Duration::from_millis(2300),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .initial_delay(Duration::from_secs(5))
            .build();
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = retry_with_cancellation(&policy, &cancel, |_| {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("still down")
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Cancelled {
                attempts: 1,
                last_error: "still down"
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
