//! Two-tier store: a shared primary (L1) behind a circuit breaker, and a local
//! fallback (L2).
//!
//! Every L1 call goes through the breaker. Any L1 failure, including a breaker fast-fail,
//! routes the call to L2. When L2 fails as well, its error is returned so the engine can
//! resolve the request through the limiter's [`FailStrategy`] and label it as a storage
//! failure rather than an enforcement.
//!
//! While serving from L2, each node enforces limits against its own local state, so a
//! cluster of `n` nodes may admit up to `(n - 1) × limit` more requests than a single
//! shared store would; see [`TieredStorage::over_admission_bound`].
//!
//! [`FailStrategy`]: crate::config::FailStrategy

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Diagnostics, StorageProvider};
use crate::algorithm::AlgorithmState;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::Timestamp;
use crate::config::LimiterConfig;
use crate::error::{CircuitError, StorageError};
use crate::telemetry::{MetricsExporter, NoopMetrics};

/// L1/L2 store with breaker-guarded failover.
pub struct TieredStorage {
    primary: Arc<dyn StorageProvider>,
    fallback: Arc<dyn StorageProvider>,
    breaker: CircuitBreaker,
    metrics: Arc<dyn MetricsExporter>,
    warned_local_enforcement: AtomicBool,
}

impl fmt::Debug for TieredStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredStorage")
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl TieredStorage {
    pub fn new(
        primary: Arc<dyn StorageProvider>,
        fallback: Arc<dyn StorageProvider>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker,
            metrics: Arc::new(NoopMetrics),
            warned_local_enforcement: AtomicBool::new(false),
        }
    }

    /// Report fallbacks and breaker transitions to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsExporter>) -> Self {
        self.breaker = self.breaker.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Worst-case extra admissions across `node_count` nodes while every node enforces
    /// `limit` against its own L2.
    pub fn over_admission_bound(node_count: u64, limit: u64) -> u64 {
        node_count.saturating_sub(1).saturating_mul(limit)
    }

    fn note_fallback(&self, operation: &'static str, cause: &CircuitError<StorageError>) {
        self.metrics.record_fallback(operation, &cause.to_string());
        if cause.is_fast_fail() {
            tracing::debug!(operation, %cause, "primary store skipped, using fallback");
        } else {
            tracing::warn!(operation, %cause, "primary store failed, using fallback");
        }
        if !self.warned_local_enforcement.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "serving limits from the local fallback store; each node now enforces \
                 independently and a cluster of n nodes may admit up to (n - 1) × limit \
                 extra requests until the primary recovers"
            );
        }
    }
}

#[async_trait]
impl StorageProvider for TieredStorage {
    async fn current_time(&self) -> Result<Timestamp, StorageError> {
        match self.breaker.execute(|| self.primary.current_time()).await {
            Ok(now) => return Ok(now),
            Err(cause) => self.note_fallback("current_time", &cause),
        }
        self.fallback.current_time().await
    }

    async fn try_acquire_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        let primary = self
            .breaker
            .execute(|| self.primary.try_acquire_permits(key, config, permits, now))
            .await;
        match primary {
            Ok(allowed) => return Ok(allowed),
            Err(cause) => self.note_fallback("try_acquire", &cause),
        }

        self.fallback.try_acquire_permits(key, config, permits, now).await.map_err(|err| {
            tracing::warn!(limiter = config.name(), key, error = %err, "both storage tiers failed");
            err
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        let primary = self.breaker.execute(|| self.primary.reset(key)).await;
        let fallback = self.fallback.reset(key).await;
        match (primary, fallback) {
            (Err(cause), Err(err)) => {
                tracing::warn!(key, primary = %cause, fallback = %err, "reset failed on both tiers");
                Err(err)
            }
            (Err(cause), Ok(())) => {
                tracing::warn!(key, %cause, "reset skipped the primary store");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn get_state(&self, key: &str) -> Result<Option<AlgorithmState>, StorageError> {
        match self.breaker.execute(|| self.primary.get_state(key)).await {
            Ok(state) => return Ok(state),
            Err(cause) => self.note_fallback("get_state", &cause),
        }
        self.fallback.get_state(key).await
    }

    async fn is_healthy(&self) -> bool {
        let primary_usable =
            self.breaker.state() != CircuitState::Open && self.primary.is_healthy().await;
        primary_usable || self.fallback.is_healthy().await
    }

    async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("backend".into(), "tiered".into());
        for (key, value) in self.primary.diagnostics().await {
            diagnostics.insert(format!("l1.{key}"), value);
        }
        for (key, value) in self.fallback.diagnostics().await {
            diagnostics.insert(format!("l2.{key}"), value);
        }
        let snapshot = self.breaker.snapshot();
        diagnostics.insert("circuit_breaker.state".into(), snapshot.state.to_string().into());
        diagnostics.insert("circuit_breaker.failures".into(), snapshot.failures.into());
        diagnostics.insert("circuit_breaker.successes".into(), snapshot.successes.into());
        diagnostics.insert("circuit_breaker.failure_rate".into(), snapshot.failure_rate.into());
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::config::FailStrategy;
    use crate::storage::InMemoryStorage;
    use crate::telemetry::CountingMetrics;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Primary stub that fails every call and counts attempts.
    #[derive(Debug, Default)]
    struct DownStore {
        calls: AtomicU64,
    }

    #[async_trait]
    impl StorageProvider for DownStore {
        async fn current_time(&self) -> Result<Timestamp, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn try_acquire_permits(
            &self,
            _key: &str,
            _config: &LimiterConfig,
            _permits: u64,
            _now: Timestamp,
        ) -> Result<bool, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn reset(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn get_state(&self, _key: &str) -> Result<Option<AlgorithmState>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn is_healthy(&self) -> bool {
            false
        }

        async fn diagnostics(&self) -> Diagnostics {
            let mut diagnostics = Diagnostics::new();
            diagnostics.insert("backend".into(), "down".into());
            diagnostics
        }
    }

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        let config = CircuitBreakerConfig::builder()
            .failure_rate_threshold(0.5)
            .minimum_calls(2)
            .recovery_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        CircuitBreaker::new("l1", config).with_clock(clock.clone())
    }

    fn limiter(strategy: FailStrategy) -> LimiterConfig {
        LimiterConfig::token_bucket("api", 2, Duration::from_secs(60))
            .unwrap()
            .with_fail_strategy(strategy)
    }

    #[tokio::test]
    async fn healthy_primary_serves_requests() {
        let clock = ManualClock::new(0);
        let primary = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let fallback = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let tiered = TieredStorage::new(primary.clone(), fallback.clone(), breaker(&clock));
        let cfg = limiter(FailStrategy::FailOpen);

        assert!(tiered.try_acquire("api:k", &cfg, 0).await.unwrap());
        assert_eq!(primary.len(), 1);
        assert!(fallback.is_empty());
    }

    #[tokio::test]
    async fn failing_primary_falls_back_and_opens_breaker() {
        let clock = ManualClock::new(0);
        let primary = Arc::new(DownStore::default());
        let fallback = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let metrics = Arc::new(CountingMetrics::new());
        let tiered = TieredStorage::new(primary.clone(), fallback.clone(), breaker(&clock))
            .with_metrics(metrics.clone());
        let cfg = limiter(FailStrategy::FailClosed);

        assert!(tiered.try_acquire("api:k", &cfg, 0).await.unwrap());
        assert!(tiered.try_acquire("api:k", &cfg, 0).await.unwrap());
        assert!(!tiered.try_acquire("api:k", &cfg, 0).await.unwrap(), "L2 enforces the limit");

        assert_eq!(tiered.breaker().state(), CircuitState::Open);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2, "open breaker skips L1");
        assert_eq!(metrics.fallbacks(), 3);
        assert_eq!(fallback.len(), 1);
    }

    #[tokio::test]
    async fn both_tiers_down_returns_the_fallback_error() {
        let clock = ManualClock::new(0);
        let open = TieredStorage::new(
            Arc::new(DownStore::default()),
            Arc::new(DownStore::default()),
            breaker(&clock),
        );
        // The error surfaces whatever the strategy; the engine applies it.
        for strategy in [FailStrategy::FailOpen, FailStrategy::FailClosed] {
            let err = open.try_acquire("api:k", &limiter(strategy), 0).await.unwrap_err();
            assert!(matches!(err, StorageError::Unavailable(_)));
        }

        assert!(open.current_time().await.is_err());
        assert!(open.get_state("api:k").await.is_err());
        assert!(open.reset("api:k").await.is_err());
        assert!(!open.is_healthy().await);
    }

    #[tokio::test]
    async fn time_and_state_fall_back_to_l2() {
        let clock = ManualClock::new(5_000);
        let fallback = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let tiered = TieredStorage::new(Arc::new(DownStore::default()), fallback, breaker(&clock));

        assert_eq!(tiered.current_time().await.unwrap(), 5_000);
        let cfg = limiter(FailStrategy::FailOpen);
        assert!(tiered.try_acquire("api:k", &cfg, 5_000).await.unwrap());
        assert!(tiered.get_state("api:k").await.unwrap().is_some());
        assert!(tiered.is_healthy().await);
    }

    #[tokio::test]
    async fn recovered_primary_takes_over_after_probe() {
        let clock = ManualClock::new(0);
        let primary = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let fallback = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let tiered = TieredStorage::new(primary.clone(), fallback, breaker(&clock));

        tiered.breaker().trip();
        let cfg = limiter(FailStrategy::FailOpen);
        assert!(tiered.try_acquire("api:k", &cfg, 0).await.unwrap());
        assert!(primary.is_empty());

        clock.advance(Duration::from_secs(40));
        assert!(tiered.try_acquire("api:k", &cfg, 40_000).await.unwrap());
        assert_eq!(tiered.breaker().state(), CircuitState::Closed);
        assert_eq!(primary.len(), 1);
    }

    #[tokio::test]
    async fn diagnostics_merge_both_tiers() {
        let clock = ManualClock::new(0);
        let tiered = TieredStorage::new(
            Arc::new(DownStore::default()),
            Arc::new(InMemoryStorage::with_clock(clock.clone())),
            breaker(&clock),
        );
        let diagnostics = tiered.diagnostics().await;
        assert_eq!(diagnostics["backend"], "tiered");
        assert_eq!(diagnostics["l1.backend"], "down");
        assert_eq!(diagnostics["l2.backend"], "in_memory");
        assert_eq!(diagnostics["circuit_breaker.state"], "closed");
    }

    #[test]
    fn over_admission_bound_scales_with_nodes() {
        assert_eq!(TieredStorage::over_admission_bound(1, 100), 0);
        assert_eq!(TieredStorage::over_admission_bound(4, 100), 300);
        assert_eq!(TieredStorage::over_admission_bound(0, 100), 0);
    }
}
