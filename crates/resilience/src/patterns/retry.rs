//! Bounded retry with fixed or exponential backoff
//!
//! Retry wraps only the operation. Gate rejections happen outside of it and
//! are never seen here, so they can never be retried.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::timeout::{AttemptError, limit_attempt};
use crate::core::config::ensure;
use crate::core::{CallContext, ConfigError, ConfigResult, ResilienceConfig};
use crate::retryable::Retryable;

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        /// Delay
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `initial * multiplier^n`, capped at `max`
    Exponential {
        /// Delay before the first retry
        #[serde(with = "humantime_serde")]
        initial: Duration,
        /// Growth factor
        multiplier: f64,
        /// Upper bound
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (0 = first retry)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(retry.min(i32::MAX as u32) as i32);
                let secs = initial.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_millis(500),
        }
    }
}

/// Randomisation applied to the computed delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Use the delay as computed
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`
    Equal,
}

impl JitterPolicy {
    /// Apply jitter to a delay
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Self::None => delay,
            Self::Full if millis == 0 => delay,
            Self::Full => Duration::from_millis(fastrand::u64(0..=millis)),
            Self::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + fastrand::u64(0..=half))
            }
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: Backoff,
    /// Randomisation of the delay
    pub jitter: JitterPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: JitterPolicy::None,
        }
    }
}

impl RetryConfig {
    /// Fixed-delay retry
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            jitter: JitterPolicy::None,
        }
    }

    /// Exponential retry
    #[must_use]
    pub fn exponential(max_attempts: u32, initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                multiplier,
                max,
            },
            jitter: JitterPolicy::None,
        }
    }

    /// A single attempt, no retries
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Set jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }
}

impl ResilienceConfig for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(self.max_attempts > 0, "maxAttempts must be > 0")?;
        ensure(self.max_attempts <= 100, "maxAttempts cannot exceed 100")?;
        if let Backoff::Exponential {
            initial,
            multiplier,
            max,
        } = self.backoff
        {
            if !(multiplier.is_finite() && multiplier >= 1.0) {
                return Err(ConfigError::validation(format!(
                    "backoff multiplier must be >= 1.0, got {multiplier}"
                )));
            }
            ensure(initial <= max, "backoff initial delay cannot exceed max")?;
        }
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final value or the last attempt's error
    pub result: Result<T, AttemptError<E>>,
    /// Attempts made
    pub attempts: u32,
    /// Duration of the last attempt
    pub last_attempt_duration: Duration,
    /// Time spent in the whole loop, delays included
    pub total_duration: Duration,
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    time_limit: Option<Duration>,
}

impl RetryPolicy {
    /// Create a policy; `time_limit` bounds every attempt
    pub fn new(config: RetryConfig, time_limit: Option<Duration>) -> ConfigResult<Self> {
        config.validate()?;
        if time_limit.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::validation("timeout must be greater than 0"));
        }
        Ok(Self { config, time_limit })
    }

    /// Configuration in use
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Per-attempt time limit
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    fn next_delay(&self, retry: u32, error: &AttemptError<impl Retryable>) -> Duration {
        let delay = self.config.jitter.apply(self.config.backoff.delay(retry));
        error.retry_after().map_or(delay, |hint| hint.max(delay))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached
    ///
    /// Stops early, returning the last error, when the context is cancelled
    /// or the next delay would run past its deadline.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &CallContext, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let attempt_started = Instant::now();
            let result = limit_attempt(self.time_limit, operation()).await;
            let last_attempt_duration = attempt_started.elapsed();

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "retry succeeded");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        last_attempt_duration,
                        total_duration: started.elapsed(),
                    };
                }
                Err(error) => error,
            };

            let done = |error| RetryOutcome {
                result: Err(error),
                attempts,
                last_attempt_duration,
                total_duration: started.elapsed(),
            };

            if attempts >= self.config.max_attempts || !error.is_retryable() {
                if attempts > 1 {
                    debug!(attempts, error = %error, "retries exhausted");
                }
                return done(error);
            }

            let delay = self.next_delay(attempts - 1, &error);
            if ctx.is_cancelled() || ctx.remaining().is_some_and(|left| left <= delay) {
                debug!(attempts, ?delay, "no time left for another attempt");
                return done(error);
            }

            debug!(attempt = attempts, ?delay, error = %error, "retrying after delay");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum BackendError {
        #[error("unavailable")]
        Unavailable,
        #[error("bad request")]
        BadRequest,
    }

    impl Retryable for BackendError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Unavailable)
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig::fixed(max_attempts, Duration::from_millis(100)), None).unwrap()
    }

    #[rstest]
    #[case(0, Duration::from_millis(100))]
    #[case(1, Duration::from_millis(200))]
    #[case(2, Duration::from_millis(400))]
    #[case(10, Duration::from_secs(1))]
    fn exponential_delay_is_capped(#[case] retry: u32, #[case] expected: Duration) {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(retry), expected);
    }

    #[test]
    fn jitter_stays_in_range() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(JitterPolicy::Full.apply(delay) <= delay);
            let equal = JitterPolicy::Equal.apply(delay);
            assert!(equal >= delay / 2 && equal <= delay);
        }
        assert_eq!(JitterPolicy::None.apply(delay), delay);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy(3)
            .execute(&CallContext::new(), || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::Unavailable)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), "ok");
        assert_eq!(outcome.total_duration, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let outcome = policy(5)
            .execute(&CallContext::new(), || async { Err::<(), _>(BackendError::BadRequest) })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(AttemptError::Failed(BackendError::BadRequest))));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let outcome = policy(3)
            .execute(&CallContext::new(), || async { Err::<(), _>(BackendError::Unavailable) })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_are_retried() {
        let policy = RetryPolicy::new(
            RetryConfig::fixed(2, Duration::ZERO),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        let outcome = policy
            .execute(&CallContext::new(), || async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, BackendError>(())
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(AttemptError::TimedOut(_))));
        assert_eq!(outcome.last_attempt_duration, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retrying() {
        let ctx = CallContext::with_timeout(Duration::from_millis(150));
        let outcome = policy(10)
            .execute(&ctx, || async { Err::<(), _>(BackendError::Unavailable) })
            .await;
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn config_parses_tagged_backoff() {
        let config = RetryConfig::from_value(serde_json::json!({
            "maxAttempts": 4,
            "backoff": { "type": "exponential", "initial": "100ms", "multiplier": 2.0, "max": "2s" },
            "jitter": "equal"
        }))
        .unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.jitter, JitterPolicy::Equal);
        assert_eq!(config.backoff.delay(1), Duration::from_millis(200));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let config = RetryConfig::exponential(3, Duration::from_millis(100), 0.5, Duration::from_secs(1));
        assert!(config.validate().is_err());
        assert!(RetryConfig::fixed(0, Duration::ZERO).validate().is_err());
    }
}
