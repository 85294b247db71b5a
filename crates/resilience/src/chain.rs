//! Per-name composition of the resilience stages
//!
//! Order is fixed: bulkhead, rate limiter, circuit breaker, then the
//! (possibly retried, possibly time-limited) operation. A rejection at any
//! gate skips every inner stage; the operation never runs.

use std::future::Future;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{
    CallContext, ConfigResult, Decision, Outcome, OutcomeKind, ResilienceError, ResilienceResult,
    Stage,
};
use crate::observability::{CallEvent, EventBus, ObservabilityHooks, PolicyEvent};
use crate::patterns::bulkhead::{Bulkhead, BulkheadStats};
use crate::patterns::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, Transition};
use crate::patterns::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::patterns::retry::{RetryConfig, RetryPolicy};
use crate::patterns::timeout::AttemptError;
use crate::policy::PolicyConfig;
use crate::retryable::Retryable;

/// Where events go: the broadcast bus and the registered hooks
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    pub(crate) bus: EventBus,
    pub(crate) hooks: ObservabilityHooks,
}

impl EventSink {
    pub(crate) fn emit(&self, event: PolicyEvent) {
        self.hooks.emit(&event);
        self.bus.publish(event);
    }

    pub(crate) fn transition(&self, policy: &str, transition: Option<Transition>) {
        if let Some(transition) = transition {
            self.emit(PolicyEvent::state_changed(policy, transition));
        }
    }
}

/// Stages guarding one protected name
#[derive(Debug)]
pub struct PolicyChain {
    name: String,
    config: PolicyConfig,
    bulkhead: Option<Bulkhead>,
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: RetryPolicy,
    events: EventSink,
}

/// Point-in-time view of a chain's stages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    /// Protected name
    pub name: String,
    /// Bulkhead counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadStats>,
    /// Rate limiter counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterStats>,
    /// Breaker counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerStats>,
}

impl PolicyChain {
    pub(crate) fn new(name: &str, config: &PolicyConfig, events: EventSink) -> ConfigResult<Self> {
        let bulkhead = config
            .bulkhead
            .clone()
            .map(|c| Bulkhead::new(name, c))
            .transpose()?;
        let rate_limiter = config
            .rate_limiter
            .clone()
            .map(|c| RateLimiter::new(name, c))
            .transpose()?;
        let circuit_breaker = config
            .circuit_breaker
            .clone()
            .map(|c| CircuitBreaker::new(name, c))
            .transpose()?;
        let retry = RetryPolicy::new(config.retry.unwrap_or_else(RetryConfig::none), config.timeout)?;

        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            bulkhead,
            rate_limiter,
            circuit_breaker,
            retry,
            events,
        })
    }

    /// Protected name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the chain was built from
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Bulkhead stage
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// Rate limiter stage
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Circuit breaker stage
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// Retry stage (a single attempt when not configured)
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Counters of every configured stage
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            name: self.name.clone(),
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::stats),
            rate_limiter: self.rate_limiter.as_ref().map(RateLimiter::stats),
            circuit_breaker: self.circuit_breaker.as_ref().map(CircuitBreaker::stats),
        }
    }

    /// Force the breaker back to closed
    pub fn reset_circuit_breaker(&self) {
        if let Some(breaker) = &self.circuit_breaker {
            self.events.transition(&self.name, breaker.reset());
        }
    }

    /// Run `operation` through every stage
    ///
    /// The operation is invoked once per attempt. Its error type decides
    /// whether a failed attempt is retried. The aggregate outcome, not each
    /// attempt, is recorded into the circuit breaker.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &CallContext, operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
    {
        self.execute_detailed(ctx, operation)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`execute`](Self::execute), also returning how many attempts
    /// the successful call took
    pub async fn execute_detailed<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
    {
        let started = Instant::now();

        let slot = match &self.bulkhead {
            Some(bulkhead) => Some(
                bulkhead
                    .acquire(ctx)
                    .await
                    .map_err(|e| self.rejected(Stage::Bulkhead, e, started))?,
            ),
            None => None,
        };

        if let Some(limiter) = &self.rate_limiter {
            limiter
                .acquire(ctx)
                .await
                .map_err(|e| self.rejected(Stage::RateLimiter, e, started))?;
        }

        let permit = match &self.circuit_breaker {
            Some(breaker) => {
                let permit = breaker
                    .try_acquire()
                    .map_err(|e| self.rejected(Stage::CircuitBreaker, e, started))?;
                self.events.transition(&self.name, permit.transition());
                Some(permit)
            }
            None => None,
        };

        let retried = self.retry.execute(ctx, operation).await;
        let attempts = retried.attempts;

        let (kind, result) = if ctx.is_expired() {
            debug!(policy = %self.name, attempts, "caller deadline elapsed, discarding result");
            (OutcomeKind::Timeout, Err(ctx.deadline_error("operation")))
        } else {
            match retried.result {
                Ok(value) => (OutcomeKind::Success, Ok(value)),
                Err(AttemptError::TimedOut(limit)) => (
                    OutcomeKind::Timeout,
                    Err(ResilienceError::timeout(
                        limit,
                        format!("attempt {attempts} exceeded its time limit"),
                    )),
                ),
                Err(AttemptError::Failed(error)) => {
                    let retryable = error.is_retryable();
                    (
                        OutcomeKind::Failure,
                        Err(ResilienceError::operation_failed(attempts, retryable, error)),
                    )
                }
            }
        };

        if let (Some(breaker), Some(permit)) = (&self.circuit_breaker, permit) {
            let outcome = Outcome::new(kind, retried.last_attempt_duration);
            self.events
                .transition(&self.name, breaker.on_complete(permit, &outcome));
        }

        drop(slot);
        self.events.emit(PolicyEvent::Call(CallEvent {
            policy: self.name.clone(),
            stage: Stage::Operation,
            decision: Decision::Admitted,
            outcome: Some(kind),
            attempts,
            duration: started.elapsed(),
            timestamp: Utc::now(),
        }));
        if kind.is_failure() {
            debug!(policy = %self.name, %kind, attempts, "call failed");
        }
        result.map(|value| (value, attempts))
    }

    fn rejected(&self, stage: Stage, error: ResilienceError, started: Instant) -> ResilienceError {
        if !error.is_rejection() {
            warn!(policy = %self.name, %stage, %error, "call abandoned while waiting for admission");
        }
        self.events.emit(PolicyEvent::Call(CallEvent {
            policy: self.name.clone(),
            stage,
            decision: Decision::Rejected,
            outcome: None,
            attempts: 0,
            duration: started.elapsed(),
            timestamp: Utc::now(),
        }));
        error
    }
}
