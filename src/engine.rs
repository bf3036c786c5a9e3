//! The admission engine.
//!
//! [`LimiterEngine`] ties the collaborators together: it resolves a key for the request,
//! asks storage to run the limiter's algorithm atomically, applies adaptive throttling to
//! admitted requests, and reports the outcome to metrics and audit.
//!
//! The engine never fails a request because of its own machinery. Key resolution
//! failures charge the shared anonymous bucket; storage failures resolve through the
//! limiter's [`FailStrategy`](crate::config::FailStrategy).
//!
//! ```
//! use quotaguard::{InMemoryStorage, LimiterConfig, LimiterEngine, StaticKeyResolver};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # futures::executor::block_on(async {
//! let engine: LimiterEngine<str> =
//!     LimiterEngine::new(Arc::new(InMemoryStorage::new()), Arc::new(StaticKeyResolver::new("global")));
//! let config = LimiterConfig::token_bucket("api", 2, Duration::from_secs(60)).unwrap();
//!
//! assert!(engine.try_acquire("req", &config).await.is_allowed());
//! assert!(engine.try_acquire("req", &config).await.is_allowed());
//! assert!(!engine.try_acquire("req", &config).await.is_allowed());
//! # });
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::algorithm::{self, Usage};
use crate::clock::Timestamp;
use crate::config::{FailStrategy, LimiterConfig};
use crate::decision::{Decision, REASON_RATE_LIMITED, REASON_STORAGE_UNAVAILABLE};
use crate::error::{KeyResolutionError, StorageError};
use crate::key::{KeyResolver, ANONYMOUS_KEY};
use crate::registry::{LimiterRegistry, RegistryError};
use crate::storage::{Diagnostics, StorageProvider};
use crate::telemetry::{AuditEvent, AuditLogger, MetricsExporter, NoopMetrics, NullAudit};

/// Admission engine for request contexts of type `C`.
pub struct LimiterEngine<C: ?Sized> {
    storage: Arc<dyn StorageProvider>,
    resolver: Arc<dyn KeyResolver<C>>,
    metrics: Arc<dyn MetricsExporter>,
    audit: Arc<dyn AuditLogger>,
    registry: LimiterRegistry,
}

impl<C: ?Sized> fmt::Debug for LimiterEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterEngine")
            .field("storage", &self.storage)
            .field("metrics", &self.metrics)
            .field("audit", &self.audit)
            .field("registry", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl<C: ?Sized> LimiterEngine<C> {
    pub fn new(storage: Arc<dyn StorageProvider>, resolver: Arc<dyn KeyResolver<C>>) -> Self {
        Self {
            storage,
            resolver,
            metrics: Arc::new(NoopMetrics),
            audit: Arc::new(NullAudit),
            registry: LimiterRegistry::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsExporter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Use `registry` for [`try_acquire_named`](Self::try_acquire_named).
    pub fn with_registry(mut self, registry: LimiterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// "Now" on the storage clock, the time base of every [`Decision::reset_time`].
    pub async fn current_time(&self) -> Result<Timestamp, StorageError> {
        self.storage.current_time().await
    }

    /// Check one request against `config`.
    pub async fn try_acquire(&self, ctx: &C, config: &LimiterConfig) -> Decision {
        self.try_acquire_permits(ctx, config, 1).await
    }

    /// Check a request that costs `permits` units of the limit. `permits == 0` reports
    /// the current standing without consuming anything.
    pub async fn try_acquire_permits(
        &self,
        ctx: &C,
        config: &LimiterConfig,
        permits: u64,
    ) -> Decision {
        let started = Instant::now();
        let key = self.storage_key(ctx, config);

        let decision = match self.evaluate(&key, config, permits).await {
            Ok(decision) => decision,
            Err(err) => self.fail_strategy_decision(&key, config, &err),
        };

        if decision.is_allowed() {
            self.metrics.record_allow(config.name());
        } else {
            self.metrics.record_deny(config.name());
            if decision.reason() == Some(REASON_RATE_LIMITED) {
                tracing::debug!(limiter = config.name(), key = %key, "request rate limited");
                self.audit.log(AuditEvent::Enforcement {
                    limiter: config.name().to_owned(),
                    key,
                    reason: REASON_RATE_LIMITED.to_owned(),
                });
            }
        }
        self.metrics.record_latency(config.name(), started.elapsed());
        decision
    }

    /// Check one request against the registered limiter `name`, using its current
    /// configuration.
    pub async fn try_acquire_named(&self, ctx: &C, name: &str) -> Result<Decision, RegistryError> {
        let config =
            self.registry.get(name).ok_or_else(|| RegistryError::NotFound { name: name.to_owned() })?;
        Ok(self.try_acquire(ctx, &config).await)
    }

    /// Forget the state of the key `ctx` resolves to under `config`.
    pub async fn reset(&self, ctx: &C, config: &LimiterConfig) -> Result<(), StorageError> {
        let key = self.storage_key(ctx, config);
        self.storage.reset(&key).await
    }

    /// Storage diagnostics plus engine details.
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.storage.diagnostics().await;
        diagnostics.insert("storage_healthy".into(), self.storage.is_healthy().await.into());
        diagnostics.insert("registered_limiters".into(), self.registry.names().into());
        diagnostics
    }

    async fn evaluate(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
    ) -> Result<Decision, StorageError> {
        let now = self.storage.current_time().await?;
        let allowed = self.storage.try_acquire_permits(key, config, permits, now).await?;

        let usage = match self.storage.get_state(key).await {
            Ok(state) => state.and_then(|state| algorithm::inspect(&state, config, now)),
            Err(err) => {
                tracing::debug!(limiter = config.name(), key, error = %err, "could not read usage");
                None
            }
        };
        if let Some(usage) = &usage {
            self.metrics.record_usage(config.name(), usage.used, usage.limit);
        }

        if !allowed {
            let reset_time = usage.map_or(now, |u| u.reset_at);
            return Ok(Decision::deny(config, reset_time, REASON_RATE_LIMITED));
        }

        let (remaining, reset_time) = match usage {
            Some(Usage { remaining, reset_at, .. }) => (remaining, reset_at),
            None => (config.capacity().saturating_sub(permits), now),
        };
        let mut decision = Decision::allow(config, remaining, reset_time);
        if let (Some(throttle), Some(usage)) = (config.throttle(), usage) {
            let used = usage.used.max(0.0).ceil() as u64;
            decision = decision.with_delay(throttle.delay_for(used, usage.limit));
        }
        Ok(decision)
    }

    fn fail_strategy_decision(
        &self,
        key: &str,
        config: &LimiterConfig,
        err: &StorageError,
    ) -> Decision {
        let strategy = config.fail_strategy();
        let allowed = strategy.admits();
        tracing::warn!(
            limiter = config.name(),
            key,
            error = %err,
            %strategy,
            allowed,
            "storage unavailable, applying fail strategy"
        );
        self.metrics.record_error(config.name(), &err.to_string());
        self.audit.log(AuditEvent::Failure {
            limiter: config.name().to_owned(),
            key: key.to_owned(),
            error: err.to_string(),
            fail_strategy: strategy,
            allowed,
        });

        let reason = format!("{REASON_STORAGE_UNAVAILABLE}_{}", strategy_tag(strategy));
        if allowed {
            Decision::allow(config, config.capacity(), 0).with_reason(reason)
        } else {
            Decision::deny(config, 0, reason)
        }
    }

    fn storage_key(&self, ctx: &C, config: &LimiterConfig) -> String {
        let resolved = match self.resolver.resolve(ctx) {
            Ok(key) if !key.trim().is_empty() => key,
            Ok(_) => self.anonymous(config, KeyResolutionError::Missing),
            Err(err) => self.anonymous(config, err),
        };
        format!("{}:{}", config.name(), resolved)
    }

    fn anonymous(&self, config: &LimiterConfig, err: KeyResolutionError) -> String {
        tracing::warn!(limiter = config.name(), error = %err, "key resolution failed, using anonymous key");
        self.audit.log(AuditEvent::KeyResolutionFailed {
            limiter: config.name().to_owned(),
            error: err.to_string(),
        });
        ANONYMOUS_KEY.to_owned()
    }
}

fn strategy_tag(strategy: FailStrategy) -> &'static str {
    match strategy {
        FailStrategy::FailOpen => "fail_open",
        FailStrategy::FailClosed => "fail_closed",
    }
}
