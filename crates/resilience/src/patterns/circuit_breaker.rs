//! Circuit breaker driven by a count-based sliding window
//!
//! States and transitions:
//! - `Closed`: every call is admitted; each completion is recorded and the
//!   breaker opens once the window has enough calls and either the failure
//!   rate or the slow-call rate reaches its threshold.
//! - `Open`: calls are rejected until `wait_duration_in_open_state` has
//!   elapsed. The next call after that moves the breaker to `HalfOpen` and
//!   is admitted as the first trial. There is no background timer.
//! - `HalfOpen`: at most `permitted_calls_in_half_open` trials are issued,
//!   at most `max_concurrent_trials` at a time. Once all trials have
//!   completed the breaker re-opens or closes based on the trial window.
//!
//! Every transition bumps a generation number. Permits carry the generation
//! they were issued under and completions from an older generation are
//! dropped, so a slow call admitted while closed can never land in a later
//! half-open trial window.
//!
//! The closed state is served from an atomic state word without taking a
//! lock; transitions and window updates run inside one `parking_lot` mutex.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::sliding_window::SlidingWindow;
use crate::core::config::{ensure, ensure_ratio};
use crate::core::{
    ConfigError, ConfigResult, Outcome, OutcomeKind, ResilienceConfig, ResilienceError,
    ResilienceResult,
};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls are admitted and recorded
    Closed,
    /// Calls are rejected
    Open,
    /// A limited number of trial calls probe the downstream
    HalfOpen,
}

impl CircuitState {
    const fn to_atomic(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u64) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0, 1.0] at or above which the breaker opens
    #[serde(alias = "failureThreshold")]
    pub failure_rate_threshold: f64,
    /// Number of most recent outcomes considered
    pub sliding_window_size: usize,
    /// Outcomes required before rates are evaluated
    #[serde(alias = "minSamples")]
    pub minimum_number_of_calls: usize,
    /// Time spent open before a trial is admitted
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,
    /// Trials issued while half-open
    pub permitted_calls_in_half_open: u32,
    /// Trials allowed in flight at the same time
    pub max_concurrent_trials: u32,
    /// Calls at least this long count as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,
    /// Slow-call rate (0.0, 1.0] at or above which the breaker opens
    pub slow_call_rate_threshold: f64,
    /// Whether timeouts are recorded (as failures)
    pub record_timeouts: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
            wait_duration_in_open_state: Duration::from_secs(10),
            permitted_calls_in_half_open: 3,
            max_concurrent_trials: 1,
            slow_call_duration_threshold: Duration::from_secs(60),
            slow_call_rate_threshold: 1.0,
            record_timeouts: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure rate threshold
    #[must_use]
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Set window size and minimum number of calls
    #[must_use]
    pub fn with_window(mut self, size: usize, minimum_calls: usize) -> Self {
        self.sliding_window_size = size;
        self.minimum_number_of_calls = minimum_calls;
        self
    }

    /// Set the open-state wait
    #[must_use]
    pub fn with_wait_duration(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    /// Set the half-open trial budget
    #[must_use]
    pub fn with_half_open_trials(mut self, permitted: u32, concurrent: u32) -> Self {
        self.permitted_calls_in_half_open = permitted;
        self.max_concurrent_trials = concurrent;
        self
    }

    /// Enable slow-call tripping
    #[must_use]
    pub fn with_slow_calls(mut self, threshold: Duration, rate: f64) -> Self {
        self.slow_call_duration_threshold = threshold;
        self.slow_call_rate_threshold = rate;
        self
    }
}

impl ResilienceConfig for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure_ratio(self.failure_rate_threshold, "failureRateThreshold")?;
        ensure_ratio(self.slow_call_rate_threshold, "slowCallRateThreshold")?;
        ensure(self.sliding_window_size > 0, "slidingWindowSize must be > 0")?;
        ensure(
            (1..=self.sliding_window_size).contains(&self.minimum_number_of_calls),
            "minimumNumberOfCalls must be in 1..=slidingWindowSize",
        )?;
        ensure(
            self.wait_duration_in_open_state >= Duration::from_millis(1),
            "waitDurationInOpenState must be at least 1ms",
        )?;
        if self.permitted_calls_in_half_open == 0
            || self.permitted_calls_in_half_open > u32::from(u16::MAX)
        {
            return Err(ConfigError::validation(format!(
                "permittedCallsInHalfOpen must be in 1..={}",
                u16::MAX
            )));
        }
        ensure(
            (1..=self.permitted_calls_in_half_open).contains(&self.max_concurrent_trials),
            "maxConcurrentTrials must be in 1..=permittedCallsInHalfOpen",
        )
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// A state change performed by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Generation entered by this transition
    pub generation: u64,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
///
/// Hand it back through [`CircuitBreaker::on_complete`]. A trial permit that
/// is dropped without completing gives its trial slot back.
#[derive(Debug)]
#[must_use = "a permit must be completed or it is treated as abandoned"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    transition: Option<Transition>,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Generation the permit was issued under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The open to half-open transition this acquisition performed, if any
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            debug!(breaker = %self.breaker.name, generation = self.generation, "trial abandoned");
            self.breaker.abandon_trial(self.generation);
        }
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Current generation
    pub generation: u64,
    /// Failure rate of the active window (trial window while half-open)
    pub failure_rate: Option<f64>,
    /// Slow-call rate of the active window
    pub slow_call_rate: Option<f64>,
    /// Outcomes in the active window
    pub buffered_calls: usize,
    /// Failed outcomes in the active window
    pub failed_calls: usize,
    /// Calls rejected since creation
    pub not_permitted_calls: u64,
    /// Trials currently in flight
    pub trials_in_flight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

impl Phase {
    const fn state(self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    generation: u64,
    window: SlidingWindow,
    trials: SlidingWindow,
}

enum TrialGrant {
    Granted,
    Exhausted,
    Stale,
}

/// Circuit breaker for one protected name
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    /// `generation << 8 | state`, read without the lock
    state_word: AtomicU64,
    /// Half-open trial gate, see `pack_gate`
    gate: AtomicU64,
    not_permitted: AtomicU64,
}

const fn pack_state(generation: u64, state: CircuitState) -> u64 {
    (generation << 8) | state.to_atomic()
}

const fn unpack_state(word: u64) -> (u64, CircuitState) {
    (word >> 8, CircuitState::from_atomic(word & 0xff))
}

/// Low 32 bits of the generation, trials issued (16 bits), trials in flight
/// (16 bits).
const fn pack_gate(generation: u64, issued: u32, in_flight: u32) -> u64 {
    ((generation & 0xffff_ffff) << 32) | ((issued as u64 & 0xffff) << 16) | (in_flight as u64 & 0xffff)
}

const fn unpack_gate(word: u64) -> (u64, u32, u32) {
    (word >> 32, ((word >> 16) & 0xffff) as u32, (word & 0xffff) as u32)
}

const fn gate_generation(generation: u64) -> u64 {
    generation & 0xffff_ffff
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        let window = SlidingWindow::new(
            config.sliding_window_size,
            config.minimum_number_of_calls,
            config.slow_call_duration_threshold,
        );
        let trials = Self::trial_window(&config);
        Ok(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                generation: 0,
                window,
                trials,
            }),
            state_word: AtomicU64::new(pack_state(0, CircuitState::Closed)),
            gate: AtomicU64::new(pack_gate(0, config.permitted_calls_in_half_open, 0)),
            not_permitted: AtomicU64::new(0),
            config,
        })
    }

    fn trial_window(config: &CircuitBreakerConfig) -> SlidingWindow {
        let permitted = config.permitted_calls_in_half_open as usize;
        SlidingWindow::new(permitted, permitted, config.slow_call_duration_threshold)
    }

    /// Protected name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without taking the lock
    ///
    /// An open breaker whose wait has elapsed still reports `Open` until the
    /// next call arrives.
    pub fn state(&self) -> CircuitState {
        unpack_state(self.state_word.load(Ordering::Acquire)).1
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        unpack_state(self.state_word.load(Ordering::Acquire)).0
    }

    /// Decide whether a call may proceed
    pub fn try_acquire(&self) -> ResilienceResult<BreakerPermit<'_>> {
        loop {
            let (generation, state) = unpack_state(self.state_word.load(Ordering::Acquire));
            match state {
                CircuitState::Closed => return Ok(self.permit(generation, false, None)),
                CircuitState::HalfOpen => match self.grant_trial(generation) {
                    TrialGrant::Granted => return Ok(self.permit(generation, true, None)),
                    TrialGrant::Exhausted => return Err(self.reject(CircuitState::HalfOpen, None)),
                    TrialGrant::Stale => {}
                },
                CircuitState::Open => return self.acquire_when_open(),
            }
        }
    }

    fn acquire_when_open(&self) -> ResilienceResult<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => Ok(self.permit(inner.generation, false, None)),
            Phase::HalfOpen => {
                let generation = inner.generation;
                drop(inner);
                match self.grant_trial(generation) {
                    TrialGrant::Granted => Ok(self.permit(generation, true, None)),
                    TrialGrant::Exhausted | TrialGrant::Stale => {
                        Err(self.reject(CircuitState::HalfOpen, None))
                    }
                }
            }
            Phase::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                let wait = self.config.wait_duration_in_open_state;
                if elapsed >= wait {
                    let transition = self.transition(&mut inner, Phase::HalfOpen);
                    Ok(self.permit(transition.generation, true, Some(transition)))
                } else {
                    Err(self.reject(CircuitState::Open, Some(wait - elapsed)))
                }
            }
        }
    }

    fn permit(&self, generation: u64, trial: bool, transition: Option<Transition>) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            generation,
            trial,
            transition,
            settled: false,
        }
    }

    fn reject(&self, state: CircuitState, retry_after: Option<Duration>) -> ResilienceError {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, %state, ?retry_after, "call not permitted");
        ResilienceError::CircuitOpen {
            name: self.name.clone(),
            state,
            retry_after,
        }
    }

    fn grant_trial(&self, generation: u64) -> TrialGrant {
        let expected = gate_generation(generation);
        let permitted = self.config.permitted_calls_in_half_open;
        let concurrent = self.config.max_concurrent_trials;
        let mut stale = false;
        let result = self.gate.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let (gate_gen, issued, in_flight) = unpack_gate(word);
            if gate_gen != expected {
                stale = true;
                return None;
            }
            stale = false;
            if issued >= permitted || in_flight >= concurrent {
                return None;
            }
            Some(pack_gate(gate_gen, issued + 1, in_flight + 1))
        });
        match result {
            Ok(_) => TrialGrant::Granted,
            Err(_) if stale => TrialGrant::Stale,
            Err(_) => TrialGrant::Exhausted,
        }
    }

    /// Frees an in-flight slot; `reissue` also returns the issued trial
    fn release_trial(&self, generation: u64, reissue: bool) {
        let expected = gate_generation(generation);
        let _ = self.gate.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let (gate_gen, issued, in_flight) = unpack_gate(word);
            if gate_gen != expected || in_flight == 0 {
                return None;
            }
            let issued = if reissue { issued.saturating_sub(1) } else { issued };
            Some(pack_gate(gate_gen, issued, in_flight - 1))
        });
    }

    fn abandon_trial(&self, generation: u64) {
        self.release_trial(generation, true);
    }

    /// Record the outcome of an admitted call
    ///
    /// Returns the transition the outcome caused, if any.
    pub fn on_complete(&self, mut permit: BreakerPermit<'_>, outcome: &Outcome) -> Option<Transition> {
        permit.settled = true;
        let generation = permit.generation;
        let trial = permit.trial;
        drop(permit);

        if outcome.kind == OutcomeKind::Timeout && !self.config.record_timeouts {
            if trial {
                self.release_trial(generation, true);
            }
            return None;
        }

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(
                breaker = %self.name,
                permit_generation = generation,
                current_generation = inner.generation,
                "ignoring completion from an earlier phase"
            );
            return None;
        }

        match inner.phase {
            Phase::Closed => {
                inner.window.record(*outcome);
                if self.should_open(&inner.window) {
                    warn!(
                        breaker = %self.name,
                        failure_rate = ?inner.window.failure_rate(),
                        slow_call_rate = ?inner.window.slow_call_rate(),
                        buffered_calls = inner.window.len(),
                        "Circuit breaker opening"
                    );
                    let now = Instant::now();
                    return Some(self.transition(&mut inner, Phase::Open { opened_at: now }));
                }
                None
            }
            Phase::HalfOpen => {
                inner.trials.record(*outcome);
                self.release_trial(generation, false);
                if !inner.trials.has_minimum_calls() {
                    return None;
                }
                if self.should_open(&inner.trials) {
                    warn!(
                        breaker = %self.name,
                        failure_rate = ?inner.trials.failure_rate(),
                        "Circuit breaker re-opening after failed trials"
                    );
                    let now = Instant::now();
                    Some(self.transition(&mut inner, Phase::Open { opened_at: now }))
                } else {
                    Some(self.transition(&mut inner, Phase::Closed))
                }
            }
            // Open always has a newer generation than any admitted permit.
            Phase::Open { .. } => None,
        }
    }

    fn should_open(&self, window: &SlidingWindow) -> bool {
        let failing = window
            .failure_rate()
            .is_some_and(|rate| rate >= self.config.failure_rate_threshold);
        let slow = window
            .slow_call_rate()
            .is_some_and(|rate| rate >= self.config.slow_call_rate_threshold);
        failing || slow
    }

    fn transition(&self, inner: &mut Inner, to: Phase) -> Transition {
        let from = inner.phase.state();
        inner.phase = to;
        inner.generation += 1;
        let generation = inner.generation;

        let gate = match to {
            // The call performing the transition holds trial 1.
            Phase::HalfOpen => {
                inner.trials.clear();
                pack_gate(generation, 1, 1)
            }
            Phase::Closed => {
                inner.window.clear();
                pack_gate(generation, self.config.permitted_calls_in_half_open, 0)
            }
            Phase::Open { .. } => pack_gate(generation, self.config.permitted_calls_in_half_open, 0),
        };
        self.gate.store(gate, Ordering::Release);
        self.state_word
            .store(pack_state(generation, to.state()), Ordering::Release);

        let transition = Transition {
            from,
            to: to.state(),
            generation,
        };
        match to {
            Phase::Open { .. } => warn!(breaker = %self.name, %from, generation, "Circuit breaker open"),
            _ => info!(breaker = %self.name, %from, to = %to.state(), generation, "Circuit breaker transition"),
        }
        transition
    }

    /// Force the breaker back to closed with an empty window
    pub fn reset(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Closed {
            inner.window.clear();
            return None;
        }
        Some(self.transition(&mut inner, Phase::Closed))
    }

    /// Time until an open breaker admits a trial, `None` unless open
    pub fn retry_after(&self) -> Option<Duration> {
        match self.inner.lock().phase {
            Phase::Open { opened_at } => Some(
                self.config
                    .wait_duration_in_open_state
                    .saturating_sub(opened_at.elapsed()),
            ),
            _ => None,
        }
    }

    /// Counters snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let window = if inner.phase == Phase::HalfOpen {
            &inner.trials
        } else {
            &inner.window
        };
        let (_, _, in_flight) = unpack_gate(self.gate.load(Ordering::Acquire));
        CircuitBreakerStats {
            state: inner.phase.state(),
            generation: inner.generation,
            failure_rate: window.failure_rate(),
            slow_call_rate: window.slow_call_rate(),
            buffered_calls: window.len(),
            failed_calls: window.failure_count(),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
            trials_in_flight: if inner.phase == Phase::HalfOpen { in_flight } else { 0 },
        }
    }
}
