//! Fixed-window rate limiter
//!
//! Time since creation is split into cycles of `refresh_period`. Each cycle
//! starts with `limit_for_period` permits. The current cycle is derived from
//! the monotonic clock on every acquisition, so there is no refresh task and
//! a stalled process simply observes a later cycle when it resumes.
//!
//! State is a single `AtomicU64`: cycle number in the high 40 bits and the
//! remaining permits in the low 24 bits. Refresh and decrement happen in the
//! same compare-and-swap, so a cycle is refilled exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::ensure;
use crate::core::{CallContext, ConfigResult, ResilienceConfig, ResilienceError, ResilienceResult};

const PERMIT_BITS: u32 = 24;
const PERMIT_MASK: u64 = (1 << PERMIT_BITS) - 1;
const CYCLE_MASK: u64 = (1 << (64 - PERMIT_BITS)) - 1;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Permits granted per refresh period
    pub limit_for_period: u32,
    /// Length of one period
    #[serde(with = "humantime_serde")]
    pub refresh_period: Duration,
    /// How long a caller may wait for the next period; zero rejects
    /// immediately
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            refresh_period: Duration::from_secs(1),
            timeout_duration: Duration::ZERO,
        }
    }
}

impl RateLimiterConfig {
    /// Config with the given budget and no waiting
    #[must_use]
    pub fn new(limit_for_period: u32, refresh_period: Duration) -> Self {
        Self {
            limit_for_period,
            refresh_period,
            timeout_duration: Duration::ZERO,
        }
    }

    /// Allow callers to wait for the next period
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }
}

impl ResilienceConfig for RateLimiterConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(self.limit_for_period > 0, "limitForPeriod must be > 0")?;
        ensure(
            u64::from(self.limit_for_period) <= PERMIT_MASK,
            "limitForPeriod must be below 16777216",
        )?;
        ensure(
            self.refresh_period >= Duration::from_millis(1),
            "refreshPeriod must be at least 1ms",
        )
    }

    fn default_config() -> Self {
        Self::default()
    }
}

const fn pack(cycle: u64, permits: u64) -> u64 {
    ((cycle & CYCLE_MASK) << PERMIT_BITS) | (permits & PERMIT_MASK)
}

const fn unpack(word: u64) -> (u64, u64) {
    (word >> PERMIT_BITS, word & PERMIT_MASK)
}

/// Permit budget for one protected name
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    started: Instant,
    period_nanos: u128,
    state: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter; the first period starts now
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            started: Instant::now(),
            period_nanos: config.refresh_period.as_nanos(),
            state: AtomicU64::new(pack(0, u64::from(config.limit_for_period))),
            rejected: AtomicU64::new(0),
            config,
        })
    }

    /// Protected name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn cycle_at(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.started).as_nanos() / self.period_nanos) as u64
            & CYCLE_MASK
    }

    fn until_next_cycle(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started).as_nanos();
        let into_period = elapsed % self.period_nanos;
        Duration::from_nanos((self.period_nanos - into_period) as u64)
    }

    /// Take a permit if the current period has one left
    ///
    /// On failure returns the time until the next period starts.
    fn take(&self, now: Instant) -> Result<(), Duration> {
        let current = self.cycle_at(now);
        let limit = u64::from(self.config.limit_for_period);
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (cycle, remaining) = unpack(word);
                let remaining = if current > cycle { limit } else { remaining };
                let cycle = cycle.max(current);
                (remaining > 0).then(|| pack(cycle, remaining - 1))
            })
            .map(|_| ())
            .map_err(|_| self.until_next_cycle(now))
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> ResilienceResult<()> {
        self.take(Instant::now()).map_err(|until| self.exceeded(until))
    }

    /// Take a permit, waiting for the next period when it starts within
    /// `timeout_duration`
    ///
    /// A caller whose wait would exceed the timeout is rejected right away.
    /// After waiting, acquisition is attempted once more.
    pub async fn acquire(&self, ctx: &CallContext) -> ResilienceResult<()> {
        let until = match self.take(Instant::now()) {
            Ok(()) => return Ok(()),
            Err(until) => until,
        };
        if self.config.timeout_duration.is_zero() || until > self.config.timeout_duration {
            return Err(self.exceeded(until));
        }

        debug!(limiter = %self.name, wait = ?until, "waiting for next refresh period");
        ctx.bound("rate limiter wait", async {
            tokio::time::sleep(until).await;
            Ok(())
        })
        .await?;
        self.take(Instant::now()).map_err(|until| self.exceeded(until))
    }

    fn exceeded(&self, until: Duration) -> ResilienceError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(limiter = %self.name, retry_after = ?until, "rate limit exceeded");
        ResilienceError::RateLimitExceeded {
            name: self.name.clone(),
            limit_for_period: self.config.limit_for_period,
            refresh_period: self.config.refresh_period,
            retry_after: Some(until),
        }
    }

    /// Permits left in the current period
    pub fn available_permits(&self) -> u32 {
        let current = self.cycle_at(Instant::now());
        let (cycle, remaining) = unpack(self.state.load(Ordering::Acquire));
        if current > cycle {
            self.config.limit_for_period
        } else {
            remaining as u32
        }
    }

    /// Counters snapshot
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            limit_for_period: self.config.limit_for_period,
            available_permits: self.available_permits(),
            rejected: self.rejected.load(Ordering::Relaxed),
            next_refresh_in: self.until_next_cycle(Instant::now()),
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    /// Budget per period
    pub limit_for_period: u32,
    /// Permits left in the current period
    pub available_permits: u32,
    /// Calls rejected since creation
    pub rejected: u64,
    /// Time until the next refill
    #[serde(with = "humantime_serde")]
    pub next_refresh_in: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, period: Duration) -> RateLimiter {
        RateLimiter::new("limited", RateLimiterConfig::new(limit, period)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refills_on_rollover() {
        let rl = limiter(5, Duration::from_secs(1));
        for _ in 0..5 {
            rl.try_acquire().unwrap();
        }
        let err = rl.try_acquire().unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(rl.try_acquire().is_ok());
        assert_eq!(rl.available_permits(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_clock_skips_cycles_without_accumulating() {
        let rl = limiter(2, Duration::from_millis(100));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rl.try_acquire().is_ok());
        assert!(rl.try_acquire().is_ok());
        assert!(rl.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_boundary_within_timeout() {
        let config = RateLimiterConfig::new(1, Duration::from_millis(100))
            .with_timeout(Duration::from_millis(150));
        let rl = RateLimiter::new("limited", config).unwrap();
        rl.try_acquire().unwrap();

        let started = Instant::now();
        rl.acquire(&CallContext::new()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_boundary_is_beyond_timeout() {
        let config =
            RateLimiterConfig::new(1, Duration::from_secs(1)).with_timeout(Duration::from_millis(100));
        let rl = RateLimiter::new("limited", config).unwrap();
        rl.try_acquire().unwrap();

        let started = Instant::now();
        let err = rl.acquire(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimitExceeded { .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(rl.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_refresh_wait() {
        let config =
            RateLimiterConfig::new(1, Duration::from_secs(1)).with_timeout(Duration::from_secs(2));
        let rl = RateLimiter::new("limited", config).unwrap();
        rl.try_acquire().unwrap();
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let err = rl.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout { .. }));
    }

    #[test]
    fn config_limits() {
        assert!(RateLimiterConfig::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimiterConfig::new(1 << 24, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimiterConfig::new(5, Duration::from_micros(10)).validate().is_err());
        assert!(RateLimiterConfig::new(5, Duration::from_secs(1)).validate().is_ok());
    }
}
