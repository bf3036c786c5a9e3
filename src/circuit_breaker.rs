//! Circuit breaker with lock-free atomics and jittered recovery.
//!
//! The breaker guards calls to a storage tier. In `Closed` it counts outcomes over a
//! rolling window and opens once the failure rate crosses the threshold. In `Open` it
//! fast-fails until a jittered deadline passes, then lets a bounded number of probes
//! through in `HalfOpen`. Only a probe's outcome closes or reopens the circuit.
//!
//! State and both counters live in one `AtomicU64`, so a reader never observes a state
//! next to counts from a different epoch.
//!
//! ```
//! use quotaguard::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_rate_threshold(0.5)
//!     .minimum_calls(4)
//!     .recovery_timeout(Duration::from_secs(30))
//!     .jitter_factor(0.3)
//!     .build()
//!     .unwrap();
//! let breaker = CircuitBreaker::new("l1", config);
//!
//! let out = breaker.call(|| Ok::<_, std::io::Error>(7));
//! assert_eq!(out.unwrap(), 7);
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::clock::{duration_millis, Clock, MonotonicClock, Timestamp};
use crate::error::CircuitError;
use crate::jitter::Jitter;
use crate::telemetry::MetricsExporter;

const STATE_CLOSED: u64 = 0;
const STATE_OPEN: u64 = 1;
const STATE_HALF_OPEN: u64 = 2;

const STATE_SHIFT: u32 = 62;
const COUNT_BITS: u32 = 31;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

const NO_DEADLINE: Timestamp = u64::MAX;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and outcomes are counted.
    Closed,
    /// Calls fail fast until the recovery deadline.
    Open,
    /// A bounded number of probes test whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

fn pack(state: CircuitState, failures: u32, successes: u32) -> u64 {
    let tag = match state {
        CircuitState::Closed => STATE_CLOSED,
        CircuitState::Open => STATE_OPEN,
        CircuitState::HalfOpen => STATE_HALF_OPEN,
    };
    (tag << STATE_SHIFT)
        | ((u64::from(failures) & COUNT_MASK) << COUNT_BITS)
        | (u64::from(successes) & COUNT_MASK)
}

fn unpack(word: u64) -> (CircuitState, u32, u32) {
    let state = match word >> STATE_SHIFT {
        STATE_CLOSED => CircuitState::Closed,
        STATE_HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Open,
    };
    let failures = ((word >> COUNT_BITS) & COUNT_MASK) as u32;
    let successes = (word & COUNT_MASK) as u32;
    (state, failures, successes)
}

fn bump(count: u32) -> u32 {
    (count.saturating_add(1)).min(COUNT_MASK as u32)
}

fn rate(failures: u32, successes: u32) -> f64 {
    let total = u64::from(failures) + u64::from(successes);
    if total == 0 {
        0.0
    } else {
        f64::from(failures) / total as f64
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BreakerConfigError {
    #[error("failure rate threshold must be in (0, 1] (got {0})")]
    InvalidFailureRate(f64),
    #[error("minimum calls must be at least 1")]
    ZeroMinimumCalls,
    #[error("rolling window must be greater than zero")]
    ZeroWindow,
    #[error("recovery timeout must be greater than zero")]
    ZeroRecoveryTimeout,
    #[error("jitter factor must be in [0, 1) (got {0})")]
    InvalidJitterFactor(f64),
    #[error("max concurrent probes must be at least 1")]
    ZeroProbeLimit,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f64,
    minimum_calls: u32,
    window: Duration,
    recovery_timeout: Duration,
    jitter: Jitter,
    max_concurrent_probes: usize,
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    pub fn minimum_calls(&self) -> u32 {
        self.minimum_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn max_concurrent_probes(&self) -> usize {
        self.max_concurrent_probes
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 1,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            jitter: Jitter::Proportional(0.3),
            max_concurrent_probes: 1,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`]; unset fields keep the defaults.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfigBuilder {
    failure_rate_threshold: f64,
    minimum_calls: u32,
    window: Duration,
    recovery_timeout: Duration,
    jitter_factor: f64,
    max_concurrent_probes: usize,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_rate_threshold: defaults.failure_rate_threshold,
            minimum_calls: defaults.minimum_calls,
            window: defaults.window,
            recovery_timeout: defaults.recovery_timeout,
            jitter_factor: defaults.jitter.factor(),
            max_concurrent_probes: defaults.max_concurrent_probes,
        }
    }
}

impl CircuitBreakerConfigBuilder {
    /// Share of failed calls in the window that opens the circuit.
    pub fn failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Calls that must be recorded in the window before the rate is evaluated.
    pub fn minimum_calls(mut self, calls: u32) -> Self {
        self.minimum_calls = calls;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn max_concurrent_probes(mut self, probes: usize) -> Self {
        self.max_concurrent_probes = probes;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, BreakerConfigError> {
        let threshold = self.failure_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(BreakerConfigError::InvalidFailureRate(threshold));
        }
        if self.minimum_calls == 0 {
            return Err(BreakerConfigError::ZeroMinimumCalls);
        }
        if self.window.is_zero() {
            return Err(BreakerConfigError::ZeroWindow);
        }
        if self.recovery_timeout.is_zero() {
            return Err(BreakerConfigError::ZeroRecoveryTimeout);
        }
        let jitter = Jitter::proportional(self.jitter_factor)
            .map_err(|_| BreakerConfigError::InvalidJitterFactor(self.jitter_factor))?;
        if self.max_concurrent_probes == 0 {
            return Err(BreakerConfigError::ZeroProbeLimit);
        }

        Ok(CircuitBreakerConfig {
            failure_rate_threshold: threshold,
            minimum_calls: self.minimum_calls,
            window: self.window,
            recovery_timeout: self.recovery_timeout,
            jitter,
            max_concurrent_probes: self.max_concurrent_probes,
        })
    }
}

/// Point-in-time view of a breaker, read from a single atomic load of state and counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub failure_rate: f64,
    pub probes_in_flight: usize,
    /// When the circuit last opened, if it is open.
    pub opened_at: Option<Timestamp>,
    /// When the open circuit starts admitting probes.
    pub half_open_at: Option<Timestamp>,
}

#[derive(Debug)]
struct BreakerState {
    word: AtomicU64,
    window_start: AtomicU64,
    opened_at: AtomicU64,
    half_open_at: AtomicU64,
    probes: AtomicUsize,
}

/// Releases a probe slot when dropped, including on panic or cancellation.
struct ProbePermit<'a> {
    probes: Option<&'a AtomicUsize>,
}

impl ProbePermit<'_> {
    fn is_probe(&self) -> bool {
        self.probes.is_some()
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if let Some(probes) = self.probes {
            probes.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Lock-free circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    rng: Option<Arc<Mutex<StdRng>>>,
    metrics: Option<Arc<dyn MetricsExporter>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(BreakerState {
                word: AtomicU64::new(pack(CircuitState::Closed, 0, 0)),
                window_start: AtomicU64::new(now),
                opened_at: AtomicU64::new(NO_DEADLINE),
                half_open_at: AtomicU64::new(NO_DEADLINE),
                probes: AtomicUsize::new(0),
            }),
            config,
            clock,
            rng: None,
            metrics: None,
        }
    }

    /// Replace the clock (primarily for tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.state.window_start.store(clock.now_millis(), Ordering::Release);
        self.clock = Arc::new(clock);
        self
    }

    /// Draw recovery jitter from a seeded RNG so deadlines are reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Some(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }

    /// Report state transitions to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        unpack(self.state.word.load(Ordering::Acquire)).0
    }

    /// Failure rate in the current window.
    pub fn failure_rate(&self) -> f64 {
        let (_, failures, successes) = unpack(self.state.word.load(Ordering::Acquire));
        rate(failures, successes)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let (state, failures, successes) = unpack(self.state.word.load(Ordering::Acquire));
        let deadline = |ts: Timestamp| (ts != NO_DEADLINE).then_some(ts);
        let (opened_at, half_open_at) = match state {
            CircuitState::Open => (
                deadline(self.state.opened_at.load(Ordering::Acquire)),
                deadline(self.state.half_open_at.load(Ordering::Acquire)),
            ),
            _ => (None, None),
        };
        CircuitSnapshot {
            state,
            failures,
            successes,
            failure_rate: rate(failures, successes),
            probes_in_flight: self.state.probes.load(Ordering::Acquire),
            opened_at,
            half_open_at,
        }
    }

    /// Sample a recovery timeout: `recovery_timeout × (1 ± jitter)`.
    pub fn next_recovery_timeout(&self) -> Duration {
        let base = self.config.recovery_timeout;
        match &self.rng {
            Some(rng) => {
                let mut guard = match rng.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                self.config.jitter.apply_with_rng(base, &mut *guard)
            }
            None => self.config.jitter.apply(base),
        }
    }

    /// Force the circuit open with a fresh jittered deadline.
    pub fn trip(&self) {
        let now = self.now();
        self.arm_deadline(now);
        let previous = self
            .state
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                let (_, failures, successes) = unpack(w);
                Some(pack(CircuitState::Open, failures, successes))
            })
            .map(|w| unpack(w).0)
            .unwrap_or(CircuitState::Open);
        tracing::warn!(breaker = %self.name, from = %previous, "circuit breaker manually tripped");
        if previous != CircuitState::Open {
            self.notify(previous, CircuitState::Open);
        }
    }

    /// Force the circuit closed and clear the window. In-flight probes keep their slots
    /// until they finish.
    pub fn reset(&self) {
        let now = self.now();
        self.state.half_open_at.store(NO_DEADLINE, Ordering::Release);
        self.state.opened_at.store(NO_DEADLINE, Ordering::Release);
        self.state.window_start.store(now, Ordering::Release);
        let previous =
            unpack(self.state.word.swap(pack(CircuitState::Closed, 0, 0), Ordering::AcqRel)).0;
        tracing::info!(breaker = %self.name, from = %previous, "circuit breaker manually reset");
        if previous != CircuitState::Closed {
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Run an async operation under breaker protection.
    ///
    /// # Errors
    /// - [`CircuitError::Open`] while the circuit is open; `operation` is not called.
    /// - [`CircuitError::ProbeLimit`] when half-open and every probe slot is taken.
    /// - [`CircuitError::Inner`] when the operation itself fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CircuitError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit::<E>()?;
        let result = operation().await;
        self.record(result.is_ok(), permit.is_probe());
        drop(permit);
        result.map_err(CircuitError::Inner)
    }

    /// Synchronous counterpart of [`execute`](Self::execute).
    pub fn call<T, E>(&self, operation: impl FnOnce() -> Result<T, E>) -> Result<T, CircuitError<E>> {
        let permit = self.admit::<E>()?;
        let result = operation();
        self.record(result.is_ok(), permit.is_probe());
        drop(permit);
        result.map_err(CircuitError::Inner)
    }

    fn admit<E>(&self) -> Result<ProbePermit<'_>, CircuitError<E>> {
        loop {
            let word = self.state.word.load(Ordering::Acquire);
            let (state, failures, _) = unpack(word);
            match state {
                CircuitState::Closed => return Ok(ProbePermit { probes: None }),
                CircuitState::Open => {
                    let now = self.now();
                    let half_open_at = self.state.half_open_at.load(Ordering::Acquire);
                    if now < half_open_at {
                        return Err(CircuitError::Open {
                            failure_count: failures,
                            retry_in: Duration::from_millis(half_open_at - now),
                        });
                    }
                    if self
                        .state
                        .word
                        .compare_exchange(
                            word,
                            pack(CircuitState::HalfOpen, 0, 0),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::info!(breaker = %self.name, "circuit breaker → half-open");
                        self.notify(CircuitState::Open, CircuitState::HalfOpen);
                    }
                    // re-read: either we moved it to half-open or someone else changed it
                }
                CircuitState::HalfOpen => {
                    let max = self.config.max_concurrent_probes;
                    return match self.state.probes.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |n| (n < max).then_some(n + 1),
                    ) {
                        Ok(prev) => {
                            tracing::debug!(
                                breaker = %self.name,
                                in_flight = prev + 1,
                                max,
                                "circuit breaker: half-open probe"
                            );
                            Ok(ProbePermit { probes: Some(&self.state.probes) })
                        }
                        Err(in_flight) => Err(CircuitError::ProbeLimit { in_flight, max }),
                    };
                }
            }
        }
    }

    fn record(&self, success: bool, probe: bool) {
        let now = self.now();
        match self.state() {
            CircuitState::HalfOpen if probe => {
                if success {
                    self.close_after_probe(now);
                } else {
                    self.open(CircuitState::HalfOpen, now);
                }
            }
            CircuitState::Closed => self.count(success, now),
            // late results from calls admitted before a transition do not count
            _ => {}
        }
    }

    fn count(&self, success: bool, now: Timestamp) {
        self.roll_window(now);
        let updated = self.state.word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            let (state, failures, successes) = unpack(w);
            if state != CircuitState::Closed {
                return None;
            }
            Some(if success {
                pack(state, failures, bump(successes))
            } else {
                pack(state, bump(failures), successes)
            })
        });
        let Ok(previous) = updated else { return };
        if success {
            return;
        }

        let (_, failures, successes) = unpack(previous);
        let failures = bump(failures);
        let calls = u64::from(failures) + u64::from(successes);
        let failure_rate = rate(failures, successes);
        if calls >= u64::from(self.config.minimum_calls)
            && failure_rate >= self.config.failure_rate_threshold
            && self.open(CircuitState::Closed, now)
        {
            tracing::error!(
                breaker = %self.name,
                failures,
                calls,
                failure_rate,
                threshold = self.config.failure_rate_threshold,
                "circuit breaker → open"
            );
        }
    }

    fn roll_window(&self, now: Timestamp) {
        let start = self.state.window_start.load(Ordering::Acquire);
        if now.saturating_sub(start) < duration_millis(self.config.window) {
            return;
        }
        if self
            .state
            .window_start
            .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.state.word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (unpack(w).0 == CircuitState::Closed).then_some(pack(CircuitState::Closed, 0, 0))
            });
        }
    }

    /// Move `from` → Open. Returns whether this call made the transition.
    fn open(&self, from: CircuitState, now: Timestamp) -> bool {
        // deadline first, so a reader that sees Open never sees a stale deadline
        self.arm_deadline(now);
        let moved = self
            .state
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                let (state, failures, successes) = unpack(w);
                if state != from {
                    return None;
                }
                Some(match from {
                    CircuitState::HalfOpen => pack(CircuitState::Open, 1, 0),
                    _ => pack(CircuitState::Open, failures, successes),
                })
            })
            .is_ok();
        if moved {
            if from == CircuitState::HalfOpen {
                tracing::warn!(breaker = %self.name, "circuit breaker: probe failed → open");
            }
            self.notify(from, CircuitState::Open);
        }
        moved
    }

    fn close_after_probe(&self, now: Timestamp) {
        // The swap must be the last write: once Closed is visible another caller may
        // reopen and arm a new deadline. Closed never reads the stale deadlines.
        self.state.window_start.store(now, Ordering::Release);
        let moved = self
            .state
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (unpack(w).0 == CircuitState::HalfOpen).then_some(pack(CircuitState::Closed, 0, 0))
            })
            .is_ok();
        if moved {
            tracing::info!(breaker = %self.name, "circuit breaker → closed");
            self.notify(CircuitState::HalfOpen, CircuitState::Closed);
        }
    }

    fn arm_deadline(&self, now: Timestamp) {
        let timeout = duration_millis(self.next_recovery_timeout());
        self.state.opened_at.store(now, Ordering::Release);
        self.state.half_open_at.store(now.saturating_add(timeout), Ordering::Release);
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_state_change(&self.name, from, to);
        }
    }

    fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }
}
