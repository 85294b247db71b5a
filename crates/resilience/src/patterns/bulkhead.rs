//! Bulkhead: bounded concurrency per protected name

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::ensure;
use crate::core::{CallContext, ConfigResult, ResilienceConfig, ResilienceError, ResilienceResult};

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once
    #[serde(alias = "maxConcurrent")]
    pub max_concurrent_calls: usize,
    /// How long a caller may wait for a slot; zero rejects immediately
    #[serde(with = "humantime_serde")]
    pub max_wait_duration: Duration,
    /// Upper bound on callers waiting for a slot, unbounded when `None`
    pub max_waiting_calls: Option<usize>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
            max_waiting_calls: None,
        }
    }
}

impl BulkheadConfig {
    /// Config with the given limit and wait
    #[must_use]
    pub fn new(max_concurrent_calls: usize, max_wait_duration: Duration) -> Self {
        Self {
            max_concurrent_calls,
            max_wait_duration,
            max_waiting_calls: None,
        }
    }

    /// Bound the wait queue
    #[must_use]
    pub fn with_max_waiting_calls(mut self, limit: usize) -> Self {
        self.max_waiting_calls = Some(limit);
        self
    }
}

impl ResilienceConfig for BulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(self.max_concurrent_calls > 0, "maxConcurrentCalls must be > 0")?;
        ensure(
            self.max_concurrent_calls <= Semaphore::MAX_PERMITS,
            "maxConcurrentCalls exceeds the semaphore limit",
        )?;
        ensure(
            self.max_wait_duration <= Duration::from_secs(3600),
            "maxWaitDuration cannot exceed 1 hour",
        )
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Concurrency gate backed by a FIFO-fair semaphore
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    rejected: AtomicU64,
}

impl Bulkhead {
    /// Create a bulkhead
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            config,
        })
    }

    /// Protected name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Calls currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self) -> ResilienceResult<BulkheadPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.admit(permit)),
            Err(_) => Err(self.full(Duration::ZERO)),
        }
    }

    /// Take a slot, waiting up to `max_wait_duration` for one to free up
    ///
    /// The wait also ends early when the context's deadline passes or its
    /// token is cancelled.
    pub async fn acquire(&self, ctx: &CallContext) -> ResilienceResult<BulkheadPermit> {
        let wait = self.config.max_wait_duration;
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.admit(permit));
        }
        if wait.is_zero() {
            return Err(self.full(Duration::ZERO));
        }
        let Some(_queued) = self.enqueue() else {
            return Err(self.full(Duration::ZERO));
        };

        let started = Instant::now();
        let semaphore = Arc::clone(&self.semaphore);
        let permit = ctx
            .bound("bulkhead wait", async {
                match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    // Timed out, or the semaphore was closed
                    Ok(Err(_)) | Err(_) => Err(self.full(started.elapsed())),
                }
            })
            .await?;
        debug!(bulkhead = %self.name, waited = ?started.elapsed(), "slot acquired after waiting");
        Ok(self.admit(permit))
    }

    fn enqueue(&self) -> Option<QueueSlot<'_>> {
        let limit = self.config.max_waiting_calls.unwrap_or(usize::MAX);
        self.waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| QueueSlot(&self.waiting))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        BulkheadPermit {
            in_flight: Arc::clone(&self.in_flight),
            _slot: permit,
        }
    }

    fn full(&self, waited: Duration) -> ResilienceError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(bulkhead = %self.name, ?waited, "bulkhead full");
        ResilienceError::BulkheadFull {
            name: self.name.clone(),
            max_concurrent: self.config.max_concurrent_calls,
            waited,
        }
    }

    /// Counters snapshot
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            max_concurrent_calls: self.config.max_concurrent_calls,
            in_flight: self.in_flight(),
            available: self.available(),
            waiting: self.waiting.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A held bulkhead slot, released when dropped
///
/// Releasing consumes the permit, so a slot cannot be released twice and a
/// slot that was never acquired cannot be released at all.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct BulkheadPermit {
    in_flight: Arc<AtomicUsize>,
    _slot: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// Give the slot back
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        // Runs before `_slot` is dropped, so the count never exceeds the limit.
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bulkhead statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkheadStats {
    /// Configured limit
    pub max_concurrent_calls: usize,
    /// Slots held
    pub in_flight: usize,
    /// Slots free
    pub available: usize,
    /// Callers waiting
    pub waiting: usize,
    /// Calls rejected since creation
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    fn bulkhead(max: usize, wait: Duration) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new("bhX", BulkheadConfig::new(max, wait)).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_admits_exactly_the_limit() {
        let bh = bulkhead(2, Duration::ZERO);
        let ctx = CallContext::new();
        let calls = (0..3).map(|_| {
            let bh = Arc::clone(&bh);
            let ctx = ctx.clone();
            async move {
                let permit = bh.acquire(&ctx).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                permit.release();
                Ok::<_, ResilienceError>(())
            }
        });
        let results = join_all(calls).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(ResilienceError::BulkheadFull { .. })))
            .count();
        assert_eq!((admitted, full), (2, 1));
        assert_eq!(bh.in_flight(), 0);
        assert_eq!(bh.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_freed_slot() {
        let bh = bulkhead(1, Duration::from_secs(1));
        let held = bh.try_acquire().unwrap();
        let waiter = {
            let bh = Arc::clone(&bh);
            tokio::spawn(async move { bh.acquire(&CallContext::new()).await.map(|p| p.release()) })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bh.stats().waiting, 1);
        held.release();
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(bh.stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded() {
        let bh = bulkhead(1, Duration::from_millis(200));
        let _held = bh.try_acquire().unwrap();
        let err = bh.acquire(&CallContext::new()).await.unwrap_err();
        match err {
            ResilienceError::BulkheadFull { waited, max_concurrent, .. } => {
                assert_eq!(max_concurrent, 1);
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_aborts_wait() {
        let bh = bulkhead(1, Duration::from_secs(10));
        let _held = bh.try_acquire().unwrap();
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = bh.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout { .. }));
        assert_eq!(bh.stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_queue_is_bounded() {
        let bh = Arc::new(
            Bulkhead::new(
                "bhY",
                BulkheadConfig::new(1, Duration::from_secs(5)).with_max_waiting_calls(1),
            )
            .unwrap(),
        );
        let _held = bh.try_acquire().unwrap();
        let first = {
            let bh = Arc::clone(&bh);
            tokio::spawn(async move { bh.acquire(&CallContext::new()).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = bh.acquire(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::BulkheadFull { waited, .. } if waited.is_zero()));
        first.abort();
    }

    #[test]
    fn rejects_zero_limit() {
        assert!(Bulkhead::new("x", BulkheadConfig::new(0, Duration::ZERO)).is_err());
    }
}
