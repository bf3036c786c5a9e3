//! In-process store.
//!
//! State lives in a sharded [`DashMap`]. The admission cycle runs while holding the
//! entry's shard lock, so concurrent checks on one key serialize while checks on keys in
//! other shards proceed in parallel. Expired entries are treated as absent on access and
//! removed in bulk by [`InMemoryStorage::purge_expired`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::{Diagnostics, StorageProvider};
use crate::algorithm::{self, AlgorithmState};
use crate::clock::{duration_millis, Clock, SystemClock, Timestamp};
use crate::config::LimiterConfig;
use crate::error::StorageError;

#[derive(Debug, Clone, Copy)]
struct StoredState {
    state: AlgorithmState,
    expires_at: Timestamp,
}

impl StoredState {
    fn live(&self, now: Timestamp) -> Option<&AlgorithmState> {
        (now < self.expires_at).then_some(&self.state)
    }
}

/// Sharded in-memory store with lazy TTL expiry.
#[derive(Debug)]
pub struct InMemoryStorage {
    entries: DashMap<String, StoredState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    /// Store reading wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store reading time from `clock` (tests use a manual clock).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { entries: DashMap::new(), clock: Arc::new(clock) }
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!(purged, "purged expired limiter state");
        }
        purged
    }

    fn acquire(&self, key: &str, config: &LimiterConfig, permits: u64, now: Timestamp) -> bool {
        let ttl = duration_millis(config.ttl());
        let expiry_now = self.clock.now_millis();
        let stored = |state| StoredState { state, expires_at: expiry_now.saturating_add(ttl) };

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let prev = occupied.get().live(expiry_now).copied();
                let transition = algorithm::apply(prev.as_ref(), permits, now, config);
                occupied.insert(stored(transition.state));
                transition.allowed
            }
            Entry::Vacant(vacant) => {
                let transition = algorithm::apply(None, permits, now, config);
                vacant.insert(stored(transition.state));
                transition.allowed
            }
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn current_time(&self) -> Result<Timestamp, StorageError> {
        Ok(self.clock.now_millis())
    }

    async fn try_acquire_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        Ok(self.acquire(key, config, permits, now))
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<AlgorithmState>, StorageError> {
        let now = self.clock.now_millis();
        Ok(self.entries.get(key).and_then(|stored| stored.live(now).copied()))
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("backend".into(), "in_memory".into());
        diagnostics.insert("keys".into(), self.entries.len().into());
        diagnostics.insert("healthy".into(), true.into());
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TokenBucketState;
    use crate::clock::ManualClock;
    use futures::executor::block_on;
    use std::time::Duration;

    fn bucket(capacity: u64) -> LimiterConfig {
        LimiterConfig::token_bucket("api", capacity, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn persists_state_between_calls() {
        let clock = ManualClock::new(1_000);
        let store = InMemoryStorage::with_clock(clock.clone());
        let cfg = bucket(2);

        block_on(async {
            assert!(store.try_acquire("k", &cfg, 1_000).await.unwrap());
            assert!(store.try_acquire("k", &cfg, 1_000).await.unwrap());
            assert!(!store.try_acquire("k", &cfg, 1_000).await.unwrap());
            assert!(store.try_acquire("other", &cfg, 1_000).await.unwrap());
        });
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn denied_checks_still_write_state() {
        let clock = ManualClock::new(0);
        let store = InMemoryStorage::with_clock(clock.clone());
        let cfg = bucket(1);

        block_on(async {
            assert!(store.try_acquire("k", &cfg, 0).await.unwrap());
            // 0.1 tokens/s: 0.05 tokens after 500ms, still short of one
            assert!(!store.try_acquire("k", &cfg, 500).await.unwrap());
            let state = store.get_state("k").await.unwrap();
            assert_eq!(
                state,
                Some(AlgorithmState::TokenBucket(TokenBucketState { tokens: 0.05, last_refill: 500 }))
            );
        });
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let clock = ManualClock::new(0);
        let store = InMemoryStorage::with_clock(clock.clone());
        let cfg = bucket(1);

        block_on(async {
            assert!(store.try_acquire("k", &cfg, 0).await.unwrap());
            clock.advance(cfg.ttl());
            assert_eq!(store.get_state("k").await.unwrap(), None);
            assert_eq!(store.len(), 1, "expiry is lazy");
            assert_eq!(store.purge_expired(), 1);
            assert!(store.is_empty());
        });
    }

    #[test]
    fn reset_removes_key() {
        let store = InMemoryStorage::with_clock(ManualClock::new(0));
        let cfg = bucket(1);
        block_on(async {
            assert!(store.try_acquire("k", &cfg, 0).await.unwrap());
            store.reset("k").await.unwrap();
            assert!(store.try_acquire("k", &cfg, 0).await.unwrap());
        });
    }

    #[test]
    fn diagnostics_are_populated() {
        let store = InMemoryStorage::new();
        let diagnostics = block_on(store.diagnostics());
        assert_eq!(diagnostics["backend"], "in_memory");
        assert_eq!(diagnostics["keys"], 0);
        assert_eq!(diagnostics["healthy"], true);
        assert!(block_on(store.is_healthy()));
    }
}
