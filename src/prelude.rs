//! Convenient re-exports for embedding the engine.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    config::{AlgorithmKind, FailStrategy, LimiterConfig},
    decision::Decision,
    engine::LimiterEngine,
    error::{AdmissionError, StorageError},
    key::{FnKeyResolver, KeyResolver, StaticKeyResolver},
    layer::AdmissionLayer,
    registry::LimiterRegistry,
    storage::{InMemoryStorage, StorageProvider, TieredStorage},
    telemetry::{AuditLogger, LogAudit, MetricsExporter},
    throttle::{ThrottleConfig, ThrottleStrategy},
};
