//! # Bulwark Resilience
//!
//! Policy engine that guards calls to a degraded or overloaded downstream
//! dependency. Every protected name gets a chain of gates around the call:
//!
//! - **Bulkhead**: bounded concurrency with a bounded wait for a slot
//! - **Rate Limiter**: fixed-window permit budget
//! - **Circuit Breaker**: closed/open/half-open state machine over a sliding
//!   window of outcomes
//! - **Retry**: bounded re-attempts of retryable failures, with an optional
//!   per-attempt time limit
//!
//! Every call and every breaker transition is published as a
//! [`PolicyEvent`].
//!
//! ## Quick Start
//!
//! ```rust
//! use bulwark_resilience::prelude::*;
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("backend unavailable")]
//! struct Unavailable;
//!
//! impl Retryable for Unavailable {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let policies = PolicySet::default().with_policy(
//!         "backendB",
//!         PolicyConfig::default()
//!             .with_circuit_breaker(CircuitBreakerConfig::default())
//!             .with_retry(RetryConfig::fixed(3, Duration::from_millis(100))),
//!     );
//!     let manager = ResilienceManager::new(policies)?;
//!
//!     let greeting = manager
//!         .execute("backendB", || async { Ok::<_, Unavailable>("hello") })
//!         .await?;
//!     assert_eq!(greeting, "hello");
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

// Core module with fundamental types
pub mod core;

// Pattern implementations
pub mod patterns;

// Events and hooks
pub mod observability;

// Composition
mod chain;
mod manager;
mod policy;
mod retryable;

pub use chain::{ChainSnapshot, PolicyChain};
pub use manager::ResilienceManager;
pub use policy::{PolicyConfig, PolicySet};
pub use retryable::Retryable;

// Public API - core types
pub use crate::core::{
    CallContext, ConfigError, ConfigResult, Decision, Outcome, OutcomeKind, ResilienceConfig,
    ResilienceError, ResilienceResult, Stage,
};

// Public API - patterns
pub use patterns::{
    Backoff, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    FallbackStrategy, FunctionFallback, JitterPolicy, RateLimiter, RateLimiterConfig,
    RejectionFallback, RetryConfig, RetryPolicy, SlidingWindow, ValueFallback,
};

// Public API - observability
pub use observability::{
    CallEvent, EventBus, LogLevel, LoggingHook, MetricsHook, ObservabilityHook,
    ObservabilityHooks, PolicyEvent,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::core::{CallContext, ResilienceError, ResilienceResult};
    pub use crate::patterns::{
        BulkheadConfig, CircuitBreakerConfig, FallbackStrategy, RateLimiterConfig, RetryConfig,
        ValueFallback,
    };
    pub use crate::{PolicyConfig, PolicyEvent, PolicySet, ResilienceManager, Retryable};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
