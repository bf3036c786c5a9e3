//! Storage contract for limiter state.
//!
//! A store owns per-key [`AlgorithmState`] and performs the read-apply-write cycle of an
//! admission check atomically with respect to every other check on the same key. No
//! caller ever reads state, decides, and writes it back as separate steps.
//!
//! Stores report their own notion of "now" through [`StorageProvider::current_time`].
//! For a shared remote store that is the server's clock, which keeps windows aligned
//! across nodes whose local clocks drift.
//!
//! Implementations:
//! - [`memory::InMemoryStorage`]: per-process, sharded, lazily expiring.
//! - [`tiered::TieredStorage`]: an L1/L2 pair behind a circuit breaker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::algorithm::AlgorithmState;
use crate::clock::Timestamp;
use crate::config::LimiterConfig;
use crate::error::StorageError;

pub mod memory;
pub mod tiered;

pub use memory::InMemoryStorage;
pub use tiered::TieredStorage;

/// Free-form health and diagnostic information reported by a store.
pub type Diagnostics = HashMap<String, serde_json::Value>;

/// Backend that owns limiter state.
#[async_trait]
pub trait StorageProvider: Send + Sync + fmt::Debug {
    /// The store's authoritative time in milliseconds since the Unix epoch.
    async fn current_time(&self) -> Result<Timestamp, StorageError>;

    /// Atomically load the state for `key`, apply `config`'s algorithm for `permits` at
    /// `now`, and persist the new state with the config's TTL, whether or not the request
    /// was admitted.
    async fn try_acquire_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError>;

    /// [`try_acquire_permits`](Self::try_acquire_permits) for a single request.
    async fn try_acquire(
        &self,
        key: &str,
        config: &LimiterConfig,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        self.try_acquire_permits(key, config, 1, now).await
    }

    /// Drop all state for `key`.
    async fn reset(&self, key: &str) -> Result<(), StorageError>;

    /// Current (unexpired) state for `key`, for observability.
    async fn get_state(&self, key: &str) -> Result<Option<AlgorithmState>, StorageError>;

    async fn is_healthy(&self) -> bool;

    /// Backend details for health endpoints. Never fails; report problems as entries.
    async fn diagnostics(&self) -> Diagnostics;
}

#[async_trait]
impl<S> StorageProvider for Arc<S>
where
    S: StorageProvider + ?Sized,
{
    async fn current_time(&self) -> Result<Timestamp, StorageError> {
        (**self).current_time().await
    }

    async fn try_acquire_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        (**self).try_acquire_permits(key, config, permits, now).await
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        (**self).reset(key).await
    }

    async fn get_state(&self, key: &str) -> Result<Option<AlgorithmState>, StorageError> {
        (**self).get_state(key).await
    }

    async fn is_healthy(&self) -> bool {
        (**self).is_healthy().await
    }

    async fn diagnostics(&self) -> Diagnostics {
        (**self).diagnostics().await
    }
}
