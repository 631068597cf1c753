//! Retry policies and generic retry wrappers for transient failures.
//!
//! A [`RetryPolicy`] answers two questions for a 1-indexed attempt number:
//! should the failed attempt be retried, and how long to wait first. Four
//! policies cover the usual shapes:
//!
//! - [`NoRetry`]: fail immediately
//! - [`FixedDelay`]: constant wait
//! - [`LinearBackoff`]: `initial + increment * (attempt - 1)`, capped
//! - [`ExponentialBackoff`]: `initial * multiplier^(attempt - 1)`, capped,
//!   with optional deterministic jitter
//!
//! The wrappers [`retry`] (async) and [`retry_blocking`] (sync) run an
//! operation in a loop with identical semantics: an operation is attempted
//! once, and after each failure the policy decides whether to sleep and try
//! again; `max_retries = 3` means up to four invocations.
//!
//! # Example
//!
//! ```
//! use eventfold_runtime::retry::{ExponentialBackoff, retry};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = ExponentialBackoff::new(
//!     5,
//!     Duration::from_millis(100),
//!     Duration::from_secs(10),
//!     2.0,
//!     true,
//! )?;
//!
//! let value = retry(&policy, || async {
//!     // fallible operation
//!     Ok::<_, String>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Invalid retry policy configuration, rejected at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryConfigError {
    /// The initial delay must be greater than zero.
    #[error("initial_delay must be greater than zero")]
    ZeroInitialDelay,

    /// The maximum delay must not undercut the initial delay.
    #[error("max_delay must be >= initial_delay")]
    MaxDelayBelowInitial,

    /// The backoff multiplier must be greater than zero.
    #[error("multiplier must be greater than zero")]
    NonPositiveMultiplier,
}

/// Decides whether a failed attempt is retried and how long to wait first.
///
/// Attempt numbers are 1-indexed: attempt 1 is the first failure. An
/// attempt number of 0 always yields a zero delay.
pub trait RetryPolicy: Send + Sync {
    /// Whether the given failed attempt should be retried.
    fn should_retry(&self, attempt: u32) -> bool;

    /// Delay before retrying after the given failed attempt.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32) -> bool {
        false
    }

    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Constant delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    max_retries: u32,
    delay: Duration,
}

impl FixedDelay {
    /// Create a fixed-delay policy. Any combination is valid: `Duration` is
    /// unsigned, so there is nothing to reject.
    #[must_use]
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

/// Linearly growing delay: `initial + increment * (attempt - 1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    max_retries: u32,
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
}

impl LinearBackoff {
    /// Create a linear-backoff policy.
    ///
    /// # Errors
    ///
    /// - [`RetryConfigError::ZeroInitialDelay`] when `initial_delay` is zero
    /// - [`RetryConfigError::MaxDelayBelowInitial`] when
    ///   `max_delay < initial_delay`
    pub const fn new(
        max_retries: u32,
        initial_delay: Duration,
        increment: Duration,
        max_delay: Duration,
    ) -> Result<Self, RetryConfigError> {
        if initial_delay.is_zero() {
            return Err(RetryConfigError::ZeroInitialDelay);
        }
        if max_delay.as_nanos() < initial_delay.as_nanos() {
            return Err(RetryConfigError::MaxDelayBelowInitial);
        }
        Ok(Self {
            max_retries,
            initial_delay,
            increment,
            max_delay,
        })
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self
            .initial_delay
            .saturating_add(self.increment.saturating_mul(attempt - 1));
        delay.min(self.max_delay)
    }
}

/// Exponentially growing delay: `initial * multiplier^(attempt - 1)`, capped
/// at `max_delay`, with optional jitter.
///
/// Jitter multiplies the delay by a bounded factor derived from the attempt
/// number, `1 + ((attempt mod 3) - 1) * 0.1`, which spreads retries within
/// 10% without making tests nondeterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create an exponential-backoff policy.
    ///
    /// # Errors
    ///
    /// - [`RetryConfigError::ZeroInitialDelay`] when `initial_delay` is zero
    /// - [`RetryConfigError::MaxDelayBelowInitial`] when
    ///   `max_delay < initial_delay`
    /// - [`RetryConfigError::NonPositiveMultiplier`] when `multiplier <= 0`
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: bool,
    ) -> Result<Self, RetryConfigError> {
        if initial_delay.is_zero() {
            return Err(RetryConfigError::ZeroInitialDelay);
        }
        if max_delay < initial_delay {
            return Err(RetryConfigError::MaxDelayBelowInitial);
        }
        if multiplier <= 0.0 {
            return Err(RetryConfigError::NonPositiveMultiplier);
        }
        Ok(Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
            jitter,
        })
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let mut delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        delay = delay.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let factor = 1.0 + (f64::from(attempt % 3) - 1.0) * 0.1;
            delay *= factor;
        }

        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Run an async operation under a retry policy.
///
/// The operation runs once; after each failure the policy decides whether to
/// sleep (`tokio::time::sleep`) and run again. The last error is returned
/// once retries are exhausted.
///
/// # Errors
///
/// The operation's final error.
pub async fn retry<P, F, Fut, T, E>(policy: &P, mut operation: F) -> Result<T, E>
where
    P: RetryPolicy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !policy.should_retry(attempt) {
                    tracing::error!(attempt, error = %error, "operation failed, retries exhausted");
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Run a blocking operation under a retry policy.
///
/// Identical semantics to [`retry`], sleeping with `std::thread::sleep`.
///
/// # Errors
///
/// The operation's final error.
pub fn retry_blocking<P, F, T, E>(policy: &P, mut operation: F) -> Result<T, E>
where
    P: RetryPolicy + ?Sized,
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !policy.should_retry(attempt) {
                    tracing::error!(attempt, error = %error, "operation failed, retries exhausted");
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Panics: tests fail loudly

    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn no_retry_never_retries() {
        let policy = NoRetry;
        assert!(!policy.should_retry(1));
        assert_eq!(policy.delay(1), Duration::ZERO);
    }

    #[test]
    fn fixed_delay_is_constant_within_budget() {
        let policy = FixedDelay::new(3, Duration::from_millis(250));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_millis(250));
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn linear_backoff_grows_and_caps() {
        let policy = LinearBackoff::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        )
        .unwrap();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(3));
        assert_eq!(policy.delay(3), Duration::from_secs(4)); // capped
        assert_eq!(policy.delay(9), Duration::from_secs(4));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(6),
            2.0,
            false,
        )
        .unwrap();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(6)); // capped
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let policy = ExponentialBackoff::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            true,
        )
        .unwrap();
        // factor cycles 1.0, 1.1, 0.9 with the attempt number
        assert_eq!(policy.delay(1), Duration::from_secs_f64(1.0));
        assert_eq!(policy.delay(2), Duration::from_secs_f64(2.0 * 1.1));
        assert_eq!(policy.delay(3), Duration::from_secs_f64(4.0 * 0.9));
        assert_eq!(policy.delay(4), Duration::from_secs_f64(8.0 * 1.0));
    }

    #[test]
    fn invalid_configurations_fail_at_construction() {
        assert_eq!(
            ExponentialBackoff::new(3, Duration::ZERO, Duration::from_secs(1), 2.0, false),
            Err(RetryConfigError::ZeroInitialDelay)
        );
        assert_eq!(
            ExponentialBackoff::new(
                3,
                Duration::from_secs(10),
                Duration::from_secs(1),
                2.0,
                false
            ),
            Err(RetryConfigError::MaxDelayBelowInitial)
        );
        assert_eq!(
            ExponentialBackoff::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(10),
                0.0,
                false
            ),
            Err(RetryConfigError::NonPositiveMultiplier)
        );
        assert!(
            LinearBackoff::new(
                3,
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(1)
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn retry_succeeds_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let result = retry(&NoRetry, || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let policy = FixedDelay::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let result = retry(&policy, || {
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_and_returns_last_error() {
        let policy = FixedDelay::new(2, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let result: Result<u32, String> = retry(&policy, || {
            let seen = Arc::clone(&seen);
            async move {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {attempt}"))
            }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        // initial call + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_blocking_matches_async_semantics() {
        let policy = FixedDelay::new(2, Duration::from_millis(1));
        let mut calls = 0_u32;

        let result = retry_blocking(&policy, || {
            calls += 1;
            if calls < 2 {
                Err("transient".to_string())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result, Ok(2));
    }

    proptest! {
        // Delays never decrease until the cap is reached.
        #[test]
        fn linear_delay_is_monotonic(attempt in 1u32..50) {
            let policy = LinearBackoff::new(
                50,
                Duration::from_millis(100),
                Duration::from_millis(75),
                Duration::from_secs(5),
            ).unwrap();
            prop_assert!(policy.delay(attempt + 1) >= policy.delay(attempt));
        }

        #[test]
        fn exponential_delay_is_monotonic_without_jitter(attempt in 1u32..30) {
            let policy = ExponentialBackoff::new(
                30,
                Duration::from_millis(10),
                Duration::from_secs(30),
                1.5,
                false,
            ).unwrap();
            prop_assert!(policy.delay(attempt + 1) >= policy.delay(attempt));
        }

        #[test]
        fn jitter_stays_within_bounds(attempt in 1u32..30) {
            let jittered = ExponentialBackoff::new(
                30,
                Duration::from_millis(10),
                Duration::from_secs(30),
                1.5,
                true,
            ).unwrap();
            let plain = ExponentialBackoff::new(
                30,
                Duration::from_millis(10),
                Duration::from_secs(30),
                1.5,
                false,
            ).unwrap();
            let base = plain.delay(attempt).as_secs_f64();
            let actual = jittered.delay(attempt).as_secs_f64();
            prop_assert!(actual >= base * 0.75 && actual <= base * 1.25);
        }
    }
}
