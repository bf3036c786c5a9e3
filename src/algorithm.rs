//! Admission algorithms.
//!
//! Both algorithms are pure functions of `(previous state, permits, now, config)`. They do
//! no I/O and take no locks; atomicity of the read-apply-write cycle is the store's job.
//!
//! - [`token_bucket`]: continuous refill up to a capacity; allows bursts.
//! - [`sliding_window`]: weighted blend of the previous and current fixed windows.
//!
//! State is returned on **every** call, admitted or not. Stores must persist it either
//! way, otherwise refill and rotation bookkeeping drifts.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::{AlgorithmKind, LimiterConfig};

pub mod sliding_window;
pub mod token_bucket;

pub use sliding_window::SlidingWindowState;
pub use token_bucket::TokenBucketState;

/// Per-key algorithm state, as held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmState {
    TokenBucket(TokenBucketState),
    SlidingWindow(SlidingWindowState),
}

impl AlgorithmState {
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AlgorithmState::TokenBucket(_) => AlgorithmKind::TokenBucket,
            AlgorithmState::SlidingWindow(_) => AlgorithmKind::SlidingWindow,
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State to write back, regardless of `allowed`.
    pub state: AlgorithmState,
    pub allowed: bool,
}

/// Observability view of a state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    /// Amount of the limit currently consumed, in requests.
    pub used: f64,
    /// The limit `used` is measured against (capacity or requests per window).
    pub limit: u64,
    /// Best-effort count of further requests that would be admitted right now.
    pub remaining: u64,
    /// When the limiter is expected to be fully replenished.
    pub reset_at: Timestamp,
}

/// Run the configured algorithm.
///
/// `prev` of the wrong kind (the limiter's algorithm changed) is treated as absent.
/// `permits == 0` applies refill/rotation bookkeeping without consuming anything.
pub fn apply(
    prev: Option<&AlgorithmState>,
    permits: u64,
    now: Timestamp,
    config: &LimiterConfig,
) -> Transition {
    match config.algorithm() {
        AlgorithmKind::TokenBucket => {
            let prev = match prev {
                Some(AlgorithmState::TokenBucket(s)) => Some(s),
                _ => None,
            };
            let (state, allowed) = token_bucket::apply(prev, permits, now, config);
            Transition { state: AlgorithmState::TokenBucket(state), allowed }
        }
        AlgorithmKind::SlidingWindow => {
            let prev = match prev {
                Some(AlgorithmState::SlidingWindow(s)) => Some(s),
                _ => None,
            };
            let (state, allowed) = sliding_window::apply(prev, permits, now, config);
            Transition { state: AlgorithmState::SlidingWindow(state), allowed }
        }
    }
}

/// Inspect a state without mutating it. Returns `None` if the state belongs to a
/// different algorithm than `config` describes.
pub fn inspect(state: &AlgorithmState, config: &LimiterConfig, now: Timestamp) -> Option<Usage> {
    match (state, config.algorithm()) {
        (AlgorithmState::TokenBucket(s), AlgorithmKind::TokenBucket) => {
            Some(token_bucket::inspect(s, config, now))
        }
        (AlgorithmState::SlidingWindow(s), AlgorithmKind::SlidingWindow) => {
            Some(sliding_window::inspect(s, config, now))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn dispatches_on_config_kind() {
        let tb = LimiterConfig::token_bucket("tb", 5, Duration::from_secs(1)).unwrap();
        let sw = LimiterConfig::sliding_window("sw", 5, Duration::from_secs(1)).unwrap();

        assert_eq!(apply(None, 1, 0, &tb).state.kind(), AlgorithmKind::TokenBucket);
        assert_eq!(apply(None, 1, 0, &sw).state.kind(), AlgorithmKind::SlidingWindow);
    }

    #[test]
    fn mismatched_state_is_treated_as_fresh() {
        let tb = LimiterConfig::token_bucket("tb", 5, Duration::from_secs(1)).unwrap();
        let sw = LimiterConfig::sliding_window("sw", 5, Duration::from_secs(1)).unwrap();

        let sw_state = apply(None, 1, 0, &sw).state;
        let t = apply(Some(&sw_state), 1, 0, &tb);
        assert!(t.allowed);
        assert_eq!(
            t.state,
            AlgorithmState::TokenBucket(TokenBucketState { tokens: 4.0, last_refill: 0 })
        );
        assert!(inspect(&sw_state, &tb, 0).is_none());
    }

    #[test]
    fn state_serializes_with_algorithm_tag() {
        let state = AlgorithmState::SlidingWindow(SlidingWindowState {
            window_start: 1_000,
            current_count: 3,
            previous_count: 7,
        });
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["algorithm"], "sliding_window");
        let back: AlgorithmState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
