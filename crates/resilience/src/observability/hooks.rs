//! Pluggable observers for policy events

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::event::PolicyEvent;
use crate::core::Decision;

/// Log level for [`LoggingHook`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Receives every event emitted by a [`ResilienceManager`](crate::ResilienceManager)
///
/// Called synchronously on the caller's task; keep it cheap.
pub trait ObservabilityHook: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &PolicyEvent);
}

/// Collection of observability hooks
#[derive(Default, Clone)]
pub struct ObservabilityHooks {
    hooks: Arc<Vec<Arc<dyn ObservabilityHook>>>,
}

impl std::fmt::Debug for ObservabilityHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityHooks")
            .field("len", &self.hooks.len())
            .finish()
    }
}

impl ObservabilityHooks {
    /// Empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ObservabilityHook>) -> Self {
        Arc::make_mut(&mut self.hooks).push(hook);
        self
    }

    /// Deliver an event to every hook
    pub fn emit(&self, event: &PolicyEvent) {
        for hook in self.hooks.iter() {
            hook.on_event(event);
        }
    }

    /// Number of hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook {
    level: LogLevel,
}

impl LoggingHook {
    /// Create a new logging hook
    #[must_use]
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

macro_rules! log_event {
    ($level:expr, $event:expr) => {{
        let policy = $event.policy();
        match $level {
            LogLevel::Error => tracing::error!(policy, "{}", $event),
            LogLevel::Warn => tracing::warn!(policy, "{}", $event),
            LogLevel::Info => tracing::info!(policy, "{}", $event),
            LogLevel::Debug => tracing::debug!(policy, "{}", $event),
            LogLevel::Trace => tracing::trace!(policy, "{}", $event),
        }
    }};
}

impl ObservabilityHook for LoggingHook {
    fn on_event(&self, event: &PolicyEvent) {
        log_event!(self.level, event);
    }
}

/// Counts events per policy
///
/// Keys: `{policy}.admitted`, `{policy}.rejected.{stage}`,
/// `{policy}.outcome.{kind}` and `{policy}.transition.{state}`.
#[derive(Debug, Default)]
pub struct MetricsHook {
    counters: DashMap<String, u64>,
}

impl MetricsHook {
    /// Create a new metrics hook
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, key: String) {
        *self.counters.entry(key).or_insert(0) += 1;
    }

    /// Current value of one counter
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map_or(0, |v| *v)
    }

    /// Every counter, sorted by key
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl ObservabilityHook for MetricsHook {
    fn on_event(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::Call(call) => match call.decision {
                Decision::Admitted => {
                    self.increment(format!("{}.admitted", call.policy));
                    if let Some(kind) = call.outcome {
                        self.increment(format!("{}.outcome.{kind}", call.policy));
                    }
                }
                Decision::Rejected => {
                    self.increment(format!("{}.rejected.{}", call.policy, call.stage));
                }
            },
            PolicyEvent::StateChanged { policy, to, .. } => {
                self.increment(format!("{policy}.transition.{to}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutcomeKind, Stage};
    use crate::observability::CallEvent;
    use crate::patterns::circuit_breaker::{CircuitState, Transition};
    use chrono::Utc;
    use std::time::Duration;

    fn call(decision: Decision, stage: Stage, outcome: Option<OutcomeKind>) -> PolicyEvent {
        PolicyEvent::Call(CallEvent {
            policy: "backendB".into(),
            stage,
            decision,
            outcome,
            attempts: u32::from(outcome.is_some()),
            duration: Duration::from_millis(1),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn metrics_hook_counts_by_key() {
        let metrics = Arc::new(MetricsHook::new());
        let hooks = ObservabilityHooks::new()
            .with_hook(metrics.clone())
            .with_hook(Arc::new(LoggingHook::new(LogLevel::Debug)));
        assert_eq!(hooks.len(), 2);

        hooks.emit(&call(Decision::Admitted, Stage::Operation, Some(OutcomeKind::Failure)));
        hooks.emit(&call(Decision::Admitted, Stage::Operation, Some(OutcomeKind::Success)));
        hooks.emit(&call(Decision::Rejected, Stage::CircuitBreaker, None));
        hooks.emit(&PolicyEvent::state_changed(
            "backendB",
            Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                generation: 1,
            },
        ));

        assert_eq!(metrics.counter("backendB.admitted"), 2);
        assert_eq!(metrics.counter("backendB.outcome.failure"), 1);
        assert_eq!(metrics.counter("backendB.rejected.circuit_breaker"), 1);
        assert_eq!(metrics.counter("backendB.transition.open"), 1);
        assert_eq!(metrics.counter("missing"), 0);
        assert_eq!(metrics.snapshot().len(), 5);
    }
}
