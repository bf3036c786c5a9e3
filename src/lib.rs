#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Embeddable admission control: decide whether a request may proceed, and how long it
//! should wait first, against per-key limits kept in a pluggable state store.
//!
//! ## Features
//!
//! - **Token bucket** and **sliding window** limiters, applied atomically by the store
//! - **Tiered storage**: a shared primary store guarded by a jittered circuit breaker,
//!   with a local fallback and a per-limiter fail-open / fail-closed strategy
//! - **Adaptive throttling** that delays admitted requests past a soft limit
//! - **Runtime reconfiguration** through a registry of live limiter configs
//! - **Metrics and audit** hooks, plus a tower layer for services
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaguard::{FnKeyResolver, InMemoryStorage, LimiterConfig, LimiterEngine};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Request {
//!     api_key: String,
//! }
//!
//! # futures::executor::block_on(async {
//! let engine: LimiterEngine<Request> = LimiterEngine::new(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(FnKeyResolver::new(|req: &Request| Ok(req.api_key.clone()))),
//! );
//! let config = LimiterConfig::token_bucket("api", 100, Duration::from_secs(60)).unwrap();
//!
//! let decision = engine.try_acquire(&Request { api_key: "k-1".into() }, &config).await;
//! assert!(decision.is_allowed());
//! assert_eq!(decision.remaining(), 99);
//! # });
//! ```

pub mod algorithm;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod decision;
pub mod dynamic;
pub mod engine;
pub mod error;
pub mod jitter;
pub mod key;
pub mod layer;
pub mod prelude;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod throttle;

// Re-exports
pub use algorithm::{AlgorithmState, SlidingWindowState, TokenBucketState};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock, Timestamp};
pub use config::{AlgorithmKind, FailStrategy, LimiterConfig, LimiterConfigBuilder};
pub use decision::Decision;
pub use dynamic::DynamicConfig;
pub use engine::LimiterEngine;
pub use error::{AdmissionError, CircuitError, ConfigError, KeyResolutionError, StorageError};
pub use jitter::Jitter;
pub use key::{FnKeyResolver, KeyPolicy, KeyResolver, PolicyCheckedResolver, StaticKeyResolver};
pub use layer::{AdmissionLayer, AdmissionService, InstantSleeper, Sleeper, TokioSleeper};
pub use registry::{LimiterRegistry, RegistryError};
pub use storage::{InMemoryStorage, StorageProvider, TieredStorage};
pub use telemetry::{AuditEvent, AuditLogger, MetricsExporter};
pub use throttle::{ThrottleConfig, ThrottleStrategy};
