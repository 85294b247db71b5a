//! Fallback strategies for graceful degradation

use std::marker::PhantomData;

use tracing::debug;

use crate::core::{ResilienceError, ResilienceResult};

/// Turns a failed call into a degraded response
pub trait FallbackStrategy<T>: Send + Sync {
    /// Produce the degraded value
    fn fallback(&self, error: &ResilienceError) -> ResilienceResult<T>;

    /// Whether this error should be degraded at all
    ///
    /// Default: everything except configuration errors and caller
    /// cancellation.
    fn should_fallback(&self, error: &ResilienceError) -> bool {
        !matches!(
            error,
            ResilienceError::InvalidConfig(_) | ResilienceError::Cancelled { .. }
        )
    }

    /// Degrade `result` if it failed with an eligible error
    fn recover(&self, result: ResilienceResult<T>) -> ResilienceResult<T> {
        match result {
            Err(error) if self.should_fallback(&error) => {
                debug!(%error, "serving fallback");
                self.fallback(&error)
            }
            other => other,
        }
    }
}

/// Always answer with the same value
#[derive(Debug, Clone)]
pub struct ValueFallback<T> {
    value: T,
}

impl<T> ValueFallback<T> {
    /// Create new value fallback
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send + Sync> FallbackStrategy<T> for ValueFallback<T> {
    fn fallback(&self, _error: &ResilienceError) -> ResilienceResult<T> {
        Ok(self.value.clone())
    }
}

/// Build the degraded value from the error
pub struct FunctionFallback<T, F> {
    function: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FunctionFallback<T, F>
where
    F: Fn(&ResilienceError) -> T + Send + Sync,
{
    /// Create new function fallback
    pub fn new(function: F) -> Self {
        Self {
            function,
            _marker: PhantomData,
        }
    }
}

impl<T, F> FallbackStrategy<T> for FunctionFallback<T, F>
where
    F: Fn(&ResilienceError) -> T + Send + Sync,
{
    fn fallback(&self, error: &ResilienceError) -> ResilienceResult<T> {
        Ok((self.function)(error))
    }
}

/// Degrade only gate rejections, let operation failures through
#[derive(Debug, Clone)]
pub struct RejectionFallback<S> {
    inner: S,
}

impl<S> RejectionFallback<S> {
    /// Wrap another strategy
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<T, S: FallbackStrategy<T>> FallbackStrategy<T> for RejectionFallback<S> {
    fn fallback(&self, error: &ResilienceError) -> ResilienceResult<T> {
        self.inner.fallback(error)
    }

    fn should_fallback(&self, error: &ResilienceError) -> bool {
        error.is_rejection()
    }
}
