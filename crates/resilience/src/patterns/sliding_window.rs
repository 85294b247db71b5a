//! Count-based sliding window of recent call outcomes.
//!
//! Fixed capacity ring buffer: pushing into a full window evicts the oldest
//! outcome. Failure and slow-call counts are maintained incrementally so both
//! rates are O(1).
//!
//! No internal lock. The owning circuit breaker mutates it only inside its
//! transition critical section, which gives a single writer that sees
//! outcomes in completion order.

use std::collections::VecDeque;
use std::time::Duration;

use crate::core::Outcome;

/// Ring buffer of the last `capacity` outcomes
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    entries: VecDeque<Outcome>,
    capacity: usize,
    minimum_calls: usize,
    slow_call_threshold: Duration,
    failures: usize,
    slow_calls: usize,
}

impl SlidingWindow {
    /// Create a window
    ///
    /// `minimum_calls` is clamped to `1..=capacity`; `capacity` to at least 1.
    #[must_use]
    pub fn new(capacity: usize, minimum_calls: usize, slow_call_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            minimum_calls: minimum_calls.clamp(1, capacity),
            slow_call_threshold,
            failures: 0,
            slow_calls: 0,
        }
    }

    /// Append an outcome, evicting the oldest one when full
    pub fn record(&mut self, outcome: Outcome) {
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.forget(&evicted);
            }
        }
        if outcome.is_failure() {
            self.failures += 1;
        }
        if self.is_slow(&outcome) {
            self.slow_calls += 1;
        }
        self.entries.push_back(outcome);
    }

    /// Failures over recorded calls, `None` while fewer than the minimum
    /// number of calls have been recorded
    #[must_use]
    pub fn failure_rate(&self) -> Option<f64> {
        self.rate(self.failures)
    }

    /// Calls at or above the slow-call threshold over recorded calls, `None`
    /// on insufficient data
    #[must_use]
    pub fn slow_call_rate(&self) -> Option<f64> {
        self.rate(self.slow_calls)
    }

    /// Number of recorded outcomes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of outcomes kept
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Calls required before rates are reported
    #[must_use]
    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    /// Whether enough calls were recorded to compute rates
    #[must_use]
    pub fn has_minimum_calls(&self) -> bool {
        self.entries.len() >= self.minimum_calls
    }

    /// Failed (or timed-out) outcomes currently in the window
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures
    }

    /// Slow outcomes currently in the window
    #[must_use]
    pub fn slow_call_count(&self) -> usize {
        self.slow_calls
    }

    /// Drop every outcome
    pub fn clear(&mut self) {
        self.entries.clear();
        self.failures = 0;
        self.slow_calls = 0;
    }

    /// Recorded outcomes, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<Outcome> {
        self.entries.iter().copied().collect()
    }

    fn rate(&self, count: usize) -> Option<f64> {
        if self.has_minimum_calls() {
            Some(count as f64 / self.entries.len() as f64)
        } else {
            None
        }
    }

    fn is_slow(&self, outcome: &Outcome) -> bool {
        outcome.duration >= self.slow_call_threshold
    }

    fn forget(&mut self, outcome: &Outcome) {
        if outcome.is_failure() {
            self.failures -= 1;
        }
        if self.is_slow(outcome) {
            self.slow_calls -= 1;
        }
    }
}
