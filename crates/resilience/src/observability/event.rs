//! Events emitted by the dispatcher

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Decision, OutcomeKind, Stage};
use crate::patterns::circuit_breaker::{CircuitState, Transition};

/// One call through a policy chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Protected name
    pub policy: String,
    /// Stage that decided the call: the rejecting gate, or `Operation`
    pub stage: Stage,
    /// Admitted or rejected
    pub decision: Decision,
    /// Outcome of an admitted call, `None` for rejections
    pub outcome: Option<OutcomeKind>,
    /// Attempts made (0 for rejections)
    pub attempts: u32,
    /// Time from entering the chain to completion
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Wall-clock completion time
    pub timestamp: DateTime<Utc>,
}

/// Observability event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEvent {
    /// A call completed or was rejected
    Call(CallEvent),
    /// A circuit breaker changed state
    StateChanged {
        /// Protected name
        policy: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
        /// Breaker generation entered
        generation: u64,
        /// Wall-clock transition time
        timestamp: DateTime<Utc>,
    },
}

impl PolicyEvent {
    pub(crate) fn state_changed(policy: &str, transition: Transition) -> Self {
        Self::StateChanged {
            policy: policy.to_string(),
            from: transition.from,
            to: transition.to,
            generation: transition.generation,
            timestamp: Utc::now(),
        }
    }

    /// Protected name the event belongs to
    pub fn policy(&self) -> &str {
        match self {
            Self::Call(call) => &call.policy,
            Self::StateChanged { policy, .. } => policy,
        }
    }

    /// Event time
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Call(call) => call.timestamp,
            Self::StateChanged { timestamp, .. } => *timestamp,
        }
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(call) => {
                write!(f, "{} {:?} at {}", call.policy, call.decision, call.stage)?;
                if let Some(outcome) = call.outcome {
                    write!(f, ": {outcome} after {} attempt(s)", call.attempts)?;
                }
                write!(f, " in {:?}", call.duration)
            }
            Self::StateChanged { policy, from, to, .. } => {
                write!(f, "{policy} circuit {from} -> {to}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn call_event_wire_shape() {
        let event = PolicyEvent::Call(CallEvent {
            policy: "backendB".into(),
            stage: Stage::CircuitBreaker,
            decision: Decision::Rejected,
            outcome: None,
            attempts: 0,
            duration: Duration::from_millis(3),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "call",
                "policy": "backendB",
                "stage": "circuit_breaker",
                "decision": "rejected",
                "outcome": null,
                "attempts": 0,
                "duration": "3ms",
                "timestamp": "2023-11-14T22:13:20Z",
            })
        );
        let back: PolicyEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn state_change_display() {
        let event = PolicyEvent::state_changed(
            "backendB",
            Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                generation: 1,
            },
        );
        assert_eq!(event.to_string(), "backendB circuit closed -> open");
        assert_eq!(event.policy(), "backendB");
    }
}
