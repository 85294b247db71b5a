//! Per-attempt time limiter
//!
//! The only place in the engine that drops an in-flight operation future.
//! A caller deadline (see [`CallContext`](crate::CallContext)) never does.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::retryable::Retryable;

/// Why a single attempt did not produce a value
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// The operation returned an error
    #[error(transparent)]
    Failed(E),
    /// The attempt exceeded its time limit and was dropped
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E: Retryable> AttemptError<E> {
    /// Timeouts are always retryable; failures ask the error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed(err) => err.is_retryable(),
            Self::TimedOut(_) => true,
        }
    }

    /// Delay requested by the error itself
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Failed(err) => err.retry_after(),
            Self::TimedOut(_) => None,
        }
    }
}

/// Run one attempt, dropping it if it outlives `limit`
pub async fn limit_attempt<F, T, E>(limit: Option<Duration>, attempt: F) -> Result<T, AttemptError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match limit {
        None => attempt.await.map_err(AttemptError::Failed),
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result.map_err(AttemptError::Failed),
            Err(_) => {
                debug!(?limit, "attempt exceeded its time limit");
                Err(AttemptError::TimedOut(limit))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("permanent")]
    struct Permanent;

    impl Retryable for Permanent {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let result: Result<(), AttemptError<Permanent>> =
            limit_attempt(Some(Duration::from_secs(2)), async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, AttemptError::TimedOut(d) if d == Duration::from_secs(2)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failure_classification_comes_from_the_error() {
        let result: Result<(), _> = limit_attempt(None, async { Err(Permanent) }).await;
        assert!(!result.unwrap_err().is_retryable());
    }
}
