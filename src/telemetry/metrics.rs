use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// Receives counters and gauges from the engine, the tiered store and the breaker.
///
/// Every method has an empty default so exporters only implement what they forward.
pub trait MetricsExporter: Send + Sync + fmt::Debug {
    fn record_allow(&self, _limiter: &str) {}

    fn record_deny(&self, _limiter: &str) {}

    /// A store error reached the engine and a fail strategy was applied.
    fn record_error(&self, _limiter: &str, _error: &str) {}

    /// The tiered store served `operation` from its fallback tier.
    fn record_fallback(&self, _operation: &str, _cause: &str) {}

    fn record_circuit_breaker_state_change(
        &self,
        _breaker: &str,
        _from: CircuitState,
        _to: CircuitState,
    ) {
    }

    /// Consumption after an admission check, in requests out of `limit`.
    fn record_usage(&self, _limiter: &str, _used: f64, _limit: u64) {}

    fn record_latency(&self, _limiter: &str, _latency: Duration) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsExporter for NoopMetrics {}

/// In-memory counters, mostly for tests and diagnostics endpoints.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    allows: AtomicU64,
    denies: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
    usage_samples: AtomicU64,
    latency_samples: AtomicU64,
    transitions: Mutex<Vec<(String, CircuitState, CircuitState)>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allows(&self) -> u64 {
        self.allows.load(Ordering::Relaxed)
    }

    pub fn denies(&self) -> u64 {
        self.denies.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn usage_samples(&self) -> u64 {
        self.usage_samples.load(Ordering::Relaxed)
    }

    pub fn latency_samples(&self) -> u64 {
        self.latency_samples.load(Ordering::Relaxed)
    }

    /// Breaker transitions in the order they were reported.
    pub fn transitions(&self) -> Vec<(String, CircuitState, CircuitState)> {
        match self.transitions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsExporter for CountingMetrics {
    fn record_allow(&self, _limiter: &str) {
        self.allows.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deny(&self, _limiter: &str) {
        self.denies.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, _limiter: &str, _error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fallback(&self, _operation: &str, _cause: &str) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_circuit_breaker_state_change(
        &self,
        breaker: &str,
        from: CircuitState,
        to: CircuitState,
    ) {
        let mut guard = match self.transitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((breaker.to_owned(), from, to));
    }

    fn record_usage(&self, _limiter: &str, _used: f64, _limit: u64) {
        self.usage_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, _limiter: &str, _latency: Duration) {
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_metrics_tracks_each_signal() {
        let metrics = CountingMetrics::new();
        metrics.record_allow("api");
        metrics.record_allow("api");
        metrics.record_deny("api");
        metrics.record_error("api", "timeout");
        metrics.record_fallback("try_acquire", "circuit open");
        metrics.record_usage("api", 3.0, 10);
        metrics.record_latency("api", Duration::from_micros(40));
        metrics.record_circuit_breaker_state_change(
            "l1",
            CircuitState::Closed,
            CircuitState::Open,
        );

        assert_eq!(metrics.allows(), 2);
        assert_eq!(metrics.denies(), 1);
        assert_eq!(metrics.errors(), 1);
        assert_eq!(metrics.fallbacks(), 1);
        assert_eq!(metrics.usage_samples(), 1);
        assert_eq!(metrics.latency_samples(), 1);
        assert_eq!(
            metrics.transitions(),
            vec![("l1".to_owned(), CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[test]
    fn noop_metrics_accepts_everything() {
        let metrics: &dyn MetricsExporter = &NoopMetrics;
        metrics.record_allow("api");
        metrics.record_latency("api", Duration::ZERO);
    }
}
