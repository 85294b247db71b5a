//! Registry of policy chains keyed by protected name
//!
//! Chains are created from the [`PolicySet`] either eagerly with
//! [`ResilienceManager::initialize`] at startup or lazily on the first call
//! for a name. They are never evicted. Creation is double-checked under the
//! registry write lock, so concurrent first calls for one name share a
//! single chain. Unrelated names never contend on anything but the short
//! read lock of the lookup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::chain::{ChainSnapshot, EventSink, PolicyChain};
use crate::core::{CallContext, ConfigResult, ResilienceResult};
use crate::observability::{EventBus, ObservabilityHooks, PolicyEvent};
use crate::patterns::fallback::FallbackStrategy;
use crate::policy::PolicySet;
use crate::retryable::Retryable;

/// Entry point of the engine
#[derive(Debug)]
pub struct ResilienceManager {
    policies: PolicySet,
    chains: RwLock<HashMap<String, Arc<PolicyChain>>>,
    events: EventSink,
}

impl ResilienceManager {
    /// Create a manager for a validated policy set
    pub fn new(policies: PolicySet) -> ConfigResult<Self> {
        policies.validate()?;
        Ok(Self {
            policies,
            chains: RwLock::new(HashMap::new()),
            events: EventSink::default(),
        })
    }

    /// Deliver events to `hooks` as well as the bus
    ///
    /// Applies to chains created afterwards; call before [`initialize`](Self::initialize).
    #[must_use]
    pub fn with_hooks(mut self, hooks: ObservabilityHooks) -> Self {
        self.events.hooks = hooks;
        self
    }

    /// Buffer `capacity` events per bus subscriber
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events.bus = EventBus::new(capacity);
        self
    }

    /// Build a chain for every configured name
    pub fn initialize(&self) -> ConfigResult<()> {
        for name in self.policies.policies.keys() {
            self.chain(name)?;
        }
        info!(chains = self.policies.policies.len(), "resilience policies initialized");
        Ok(())
    }

    /// Policy set in use
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Event bus
    pub fn events(&self) -> &EventBus {
        &self.events.bus
    }

    /// Subscribe to every event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.bus.subscribe()
    }

    /// Chain for `name`, created from configuration on first use
    pub fn chain(&self, name: &str) -> ConfigResult<Arc<PolicyChain>> {
        if let Some(chain) = self.chains.read().get(name) {
            return Ok(Arc::clone(chain));
        }

        let mut chains = self.chains.write();
        if let Some(chain) = chains.get(name) {
            return Ok(Arc::clone(chain));
        }
        let config = self.policies.resolve(name);
        let chain = Arc::new(PolicyChain::new(name, config, self.events.clone())?);
        info!(
            policy = name,
            configured = self.policies.policies.contains_key(name),
            bulkhead = config.bulkhead.is_some(),
            rate_limiter = config.rate_limiter.is_some(),
            circuit_breaker = config.circuit_breaker.is_some(),
            retry = config.retry.is_some(),
            "policy chain created"
        );
        chains.insert(name.to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Names with a chain, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.chains.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Counters for `name`, `None` if no chain exists yet
    pub fn snapshot(&self, name: &str) -> Option<ChainSnapshot> {
        self.chains.read().get(name).map(|chain| chain.snapshot())
    }

    /// Force the breaker of `name` back to closed
    pub fn reset(&self, name: &str) {
        if let Some(chain) = self.chains.read().get(name) {
            chain.reset_circuit_breaker();
        }
    }

    /// Run `operation` under the policy for `name`
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
    {
        self.execute_with_context(name, &CallContext::new(), operation)
            .await
    }

    /// Run `operation` under the policy for `name`, bounded by `ctx`
    #[tracing::instrument(level = "debug", skip(self, ctx, operation), fields(policy = name))]
    pub async fn execute_with_context<T, E, F, Fut>(
        &self,
        name: &str,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
    {
        let chain = self.chain(name)?;
        chain.execute(ctx, operation).await
    }

    /// Run `operation` under the policy for `name`, returning the value and
    /// the number of attempts it took
    pub async fn execute_detailed<T, E, F, Fut>(
        &self,
        name: &str,
        ctx: &CallContext,
        operation: F,
    ) -> ResilienceResult<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
    {
        let chain = self.chain(name)?;
        chain.execute_detailed(ctx, operation).await
    }

    /// Run `operation` and degrade failures through `fallback`
    pub async fn execute_with_fallback<T, E, F, Fut, S>(
        &self,
        name: &str,
        operation: F,
        fallback: &S,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Send + Sync + 'static,
        S: FallbackStrategy<T>,
    {
        fallback.recover(self.execute(name, operation).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResilienceError;
    use crate::observability::MetricsHook;
    use crate::patterns::fallback::ValueFallback;
    use crate::policy::PolicyConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("unavailable")]
    struct Unavailable;

    impl Retryable for Unavailable {}

    #[tokio::test]
    async fn chains_are_created_once() {
        let manager = ResilienceManager::new(PolicySet::demo()).unwrap();
        let a = manager.chain("backendB").unwrap();
        let b = manager.chain("backendB").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.names(), vec!["backendB".to_string()]);
        assert!(manager.snapshot("bhX").is_none());
    }

    #[tokio::test]
    async fn initialize_builds_every_configured_name() {
        let manager = ResilienceManager::new(PolicySet::demo()).unwrap();
        manager.initialize().unwrap();
        assert_eq!(
            manager.names(),
            vec!["backendB", "bhX", "bhY", "rateLimiterB", "timelimiterB", "timeoutBreaker"]
        );
        let snapshot = manager.snapshot("bhX").unwrap();
        assert!(snapshot.bulkhead.is_some());
        assert!(snapshot.circuit_breaker.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_name_gets_full_default_chain() {
        let manager = ResilienceManager::new(PolicySet::default()).unwrap();
        let value = manager
            .execute("ok", || async { Ok::<_, Unavailable>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        let chain = manager.chain("ok").unwrap();
        assert_eq!(chain.config(), &PolicyConfig::full());
        assert!(chain.bulkhead().is_some() && chain.rate_limiter().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_degrades_rejections() {
        let policies = PolicySet::default().with_policy(
            "bhY",
            PolicyConfig::default().with_bulkhead(crate::BulkheadConfig::new(
                1,
                std::time::Duration::ZERO,
            )),
        );
        let manager = ResilienceManager::new(policies).unwrap();
        let chain = manager.chain("bhY").unwrap();
        let _held = chain.bulkhead().unwrap().try_acquire().unwrap();

        let value = manager
            .execute_with_fallback(
                "bhY",
                || async { Ok::<_, Unavailable>("live") },
                &ValueFallback::new("fallback"),
            )
            .await
            .unwrap();
        assert_eq!(value, "fallback");
    }

    #[tokio::test(start_paused = true)]
    async fn detailed_execution_reports_attempts() {
        let manager = ResilienceManager::new(PolicySet::demo()).unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let (value, attempts) = manager
            .execute_detailed("backendB", &CallContext::new(), move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Unavailable)
                } else {
                    Ok("recovered")
                }
            })
            .await
            .unwrap();
        assert_eq!((value, attempts), ("recovered", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_see_events() {
        let metrics = Arc::new(MetricsHook::new());
        let manager = ResilienceManager::new(PolicySet::demo())
            .unwrap()
            .with_hooks(ObservabilityHooks::new().with_hook(metrics.clone()));

        let err = manager
            .execute("timelimiterB", || async { Err::<(), _>(Unavailable) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::OperationFailed { attempts: 1, .. }));
        assert_eq!(metrics.counter("timelimiterB.outcome.failure"), 1);
    }
}
