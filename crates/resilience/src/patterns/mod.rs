//! Resilience patterns implementations

// Gates
pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;

// Operation wrappers
pub mod fallback;
pub mod retry;
pub mod timeout;

// Breaker history
pub mod sliding_window;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    Transition,
};
pub use fallback::{FallbackStrategy, FunctionFallback, RejectionFallback, ValueFallback};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{Backoff, JitterPolicy, RetryConfig, RetryOutcome, RetryPolicy};
pub use sliding_window::SlidingWindow;
pub use timeout::{AttemptError, limit_attempt};
