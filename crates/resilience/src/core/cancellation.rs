//! Caller-supplied deadline and cancellation
//!
//! A [`CallContext`] bounds the two places where the engine may suspend a
//! caller: waiting for a bulkhead slot and waiting for a rate-limiter refresh.
//! Either wait aborts as soon as the deadline passes or the token is
//! cancelled. The downstream operation itself is never interrupted by the
//! context; if the deadline has passed by the time it completes, its result
//! is discarded.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::ResilienceError;
use super::ResilienceResult;

/// Deadline and cancellation token for one logical call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    budget: Option<Duration>,
    token: CancellationToken,
    reason: Option<String>,
}

impl CallContext {
    /// Context with no deadline and a fresh token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::new().deadline(Instant::now() + timeout);
        ctx.budget = Some(timeout);
        ctx
    }

    /// Set an absolute deadline
    #[must_use]
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self.budget = Some(deadline.saturating_duration_since(Instant::now()));
        self
    }

    /// Use an existing token (e.g. a child of a shutdown token)
    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Reason reported when the token fires
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Configured deadline
    #[must_use]
    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancellation token
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time left before the deadline; `None` if there is no deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the context is already done
    pub fn check(&self, what: &str) -> ResilienceResult<()> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        if self.is_expired() {
            return Err(self.deadline_error(what));
        }
        Ok(())
    }

    /// Run a blocking wait, aborting it on deadline or cancellation
    pub async fn bound<F, T>(&self, what: &str, wait: F) -> ResilienceResult<T>
    where
        F: Future<Output = ResilienceResult<T>>,
    {
        self.check(what)?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => {
                tracing::debug!(what, "wait cancelled");
                Err(self.cancelled_error())
            }
            () = deadline => {
                tracing::debug!(what, "caller deadline elapsed while waiting");
                Err(self.deadline_error(what))
            }
            result = wait => result,
        }
    }

    pub(crate) fn deadline_error(&self, what: &str) -> ResilienceError {
        ResilienceError::timeout(
            self.budget.unwrap_or_default(),
            format!("caller deadline elapsed during {what}"),
        )
    }

    fn cancelled_error(&self) -> ResilienceError {
        ResilienceError::Cancelled {
            reason: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bound_aborts_on_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let result: ResilienceResult<()> = ctx
            .bound("bulkhead wait", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn absolute_deadline_reports_its_budget() {
        let ctx = CallContext::new().deadline(Instant::now() + Duration::from_millis(200));
        let result: ResilienceResult<()> = ctx
            .bound("bulkhead wait", std::future::pending())
            .await;
        match result {
            Err(ResilienceError::Timeout { duration, .. }) => {
                assert_eq!(duration, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bound_aborts_on_cancel() {
        let ctx = CallContext::new().reason("shutdown");
        ctx.cancel();
        let result: ResilienceResult<()> = ctx.bound("rate limiter wait", async { Ok(()) }).await;
        match result {
            Err(ResilienceError::Cancelled { reason }) => {
                assert_eq!(reason.as_deref(), Some("shutdown"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_wait_wins() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let value = ctx.bound("wait", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.remaining().is_some());
        assert!(!ctx.is_expired());
    }
}
