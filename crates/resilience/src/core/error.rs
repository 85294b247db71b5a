//! Error types for resilience operations

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use super::config::ConfigError;
use super::types::Stage;
use crate::patterns::circuit_breaker::CircuitState;

/// Core resilience errors
///
/// The first three variants are local admission decisions (rejections): the
/// downstream operation was never invoked. They are never retried.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Circuit breaker refused the call
    #[error("circuit breaker '{name}' is {state}{}", retry_hint(*.retry_after))]
    CircuitOpen {
        /// Protected name
        name: String,
        /// Breaker state at rejection time
        state: CircuitState,
        /// Time until the breaker will admit a trial call
        retry_after: Option<Duration>,
    },

    /// No bulkhead slot became free in time
    #[error("bulkhead '{name}' full: max_concurrent={max_concurrent}, waited {waited:?}")]
    BulkheadFull {
        /// Protected name
        name: String,
        /// Configured concurrency limit
        max_concurrent: usize,
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// Permit budget for the current period is exhausted
    #[error(
        "rate limit exceeded for '{name}': {limit_for_period} per {refresh_period:?}{}",
        retry_hint(*.retry_after)
    )]
    RateLimitExceeded {
        /// Protected name
        name: String,
        /// Permits granted per refresh period
        limit_for_period: u32,
        /// Refresh period length
        refresh_period: Duration,
        /// Time until the next refresh boundary
        retry_after: Option<Duration>,
    },

    /// The wrapped operation failed (after exhausting retries if any)
    #[error("operation failed after {attempts} attempt(s): {source}")]
    OperationFailed {
        /// Number of attempts made
        attempts: u32,
        /// Whether the final error was classified as retryable
        retryable: bool,
        /// The operation's own error
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A time bound elapsed (attempt time limit, blocked wait, or caller deadline)
    #[error("timed out after {duration:?}: {context}")]
    Timeout {
        /// The bound that was exceeded
        duration: Duration,
        /// What timed out
        context: String,
    },

    /// The caller cancelled while the call was waiting for admission
    #[error("operation cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Cancellation reason
        reason: Option<String>,
    },

    /// Invalid configuration
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

fn retry_hint(retry_after: Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(" (retry after {d:?})"))
}

impl ResilienceError {
    /// Create a timeout error
    pub fn timeout(duration: Duration, context: impl Into<String>) -> Self {
        Self::Timeout {
            duration,
            context: context.into(),
        }
    }

    /// Wrap an operation error
    pub fn operation_failed<E>(attempts: u32, retryable: bool, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::OperationFailed {
            attempts,
            retryable,
            source: Box::new(source),
        }
    }

    /// Whether this is a local admission rejection (operation never ran)
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::RateLimitExceeded { .. }
        )
    }

    /// Whether retrying the same call could plausibly succeed
    ///
    /// Rejections are never retryable: the retry stage sits inside every
    /// gate, so a gate's refusal has to surface to the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::OperationFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Retry delay hint if available
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimitExceeded { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Chain stage responsible for a rejection
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::BulkheadFull { .. } => Some(Stage::Bulkhead),
            Self::RateLimitExceeded { .. } => Some(Stage::RateLimiter),
            Self::CircuitOpen { .. } => Some(Stage::CircuitBreaker),
            _ => None,
        }
    }

    /// Attempts made before this error surfaced (0 for rejections)
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::OperationFailed { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Downcast the wrapped operation error
    #[must_use]
    pub fn source_as<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::OperationFailed { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}
