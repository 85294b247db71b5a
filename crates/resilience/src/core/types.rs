//! Call outcomes and the vocabulary shared by patterns and events

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a downstream call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The operation returned successfully
    Success,
    /// The operation returned an error
    Failure,
    /// The operation did not finish within its time limit
    Timeout,
}

impl OutcomeKind {
    /// Whether this outcome counts against the failure rate.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Completed call: what happened and how long it took.
///
/// Created once the call completes and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Result classification
    pub kind: OutcomeKind,
    /// Wall time spent in the call
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Outcome {
    /// Create an outcome
    #[must_use]
    pub const fn new(kind: OutcomeKind, duration: Duration) -> Self {
        Self { kind, duration }
    }

    /// Successful call
    #[must_use]
    pub const fn success(duration: Duration) -> Self {
        Self::new(OutcomeKind::Success, duration)
    }

    /// Failed call
    #[must_use]
    pub const fn failure(duration: Duration) -> Self {
        Self::new(OutcomeKind::Failure, duration)
    }

    /// Timed-out call
    #[must_use]
    pub const fn timeout(duration: Duration) -> Self {
        Self::new(OutcomeKind::Timeout, duration)
    }

    /// Shorthand for `self.kind.is_failure()`
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.kind.is_failure()
    }
}

/// Position of a policy inside a chain, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Concurrency gate
    Bulkhead,
    /// Permit budget
    RateLimiter,
    /// Failure isolation state machine
    CircuitBreaker,
    /// The (possibly retried) downstream operation itself
    Operation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulkhead => write!(f, "bulkhead"),
            Self::RateLimiter => write!(f, "rate_limiter"),
            Self::CircuitBreaker => write!(f, "circuit_breaker"),
            Self::Operation => write!(f, "operation"),
        }
    }
}

/// Admission decision made by a gating stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The call passed every gate and reached the operation
    Admitted,
    /// A gate refused the call; inner stages never saw it
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_counts_as_failure() {
        assert!(!OutcomeKind::Success.is_failure());
        assert!(OutcomeKind::Failure.is_failure());
        assert!(OutcomeKind::Timeout.is_failure());
    }

    #[test]
    fn stages_order_outermost_first() {
        assert!(Stage::Bulkhead < Stage::RateLimiter);
        assert!(Stage::RateLimiter < Stage::CircuitBreaker);
        assert!(Stage::CircuitBreaker < Stage::Operation);
    }

    #[test]
    fn outcome_serializes_with_human_duration() {
        let outcome = Outcome::failure(Duration::from_millis(250));
        let json = serde_json::to_value(outcome).unwrap();
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["duration"], "250ms");
    }
}
