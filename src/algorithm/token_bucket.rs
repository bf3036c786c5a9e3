use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::LimiterConfig;

/// Token bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill: Timestamp,
}

/// Refill to `now` and try to take `permits` tokens.
///
/// A missing bucket starts full, so the first burst of up to `capacity` succeeds.
/// Elapsed time is clamped at zero under clock skew and `last_refill` never moves
/// backwards, so a skewed call cannot cause the same interval to be refilled twice.
pub fn apply(
    prev: Option<&TokenBucketState>,
    permits: u64,
    now: Timestamp,
    config: &LimiterConfig,
) -> (TokenBucketState, bool) {
    let capacity = config.capacity() as f64;
    let (tokens, last_refill) = match prev {
        Some(s) => (s.tokens, s.last_refill),
        None => (capacity, now),
    };
    let available = refill(tokens, last_refill, now, capacity, config.refill_rate());
    let stamp = last_refill.max(now);
    let cost = permits as f64;

    if available >= cost {
        (TokenBucketState { tokens: available - cost, last_refill: stamp }, true)
    } else {
        (TokenBucketState { tokens: available, last_refill: stamp }, false)
    }
}

pub(crate) fn inspect(
    state: &TokenBucketState,
    config: &LimiterConfig,
    now: Timestamp,
) -> super::Usage {
    let capacity = config.capacity() as f64;
    let rate = config.refill_rate();
    let available = refill(state.tokens, state.last_refill, now, capacity, rate);
    let missing_ms = ((capacity - available) / rate * 1000.0).ceil();
    let reset_at = if missing_ms.is_finite() && missing_ms < u64::MAX as f64 {
        now.saturating_add(missing_ms.max(0.0) as u64)
    } else {
        u64::MAX
    };

    super::Usage {
        used: capacity - available,
        limit: config.capacity(),
        remaining: available.floor() as u64,
        reset_at,
    }
}

fn refill(tokens: f64, last_refill: Timestamp, now: Timestamp, capacity: f64, rate: f64) -> f64 {
    let elapsed_secs = now.saturating_sub(last_refill) as f64 / 1000.0;
    let tokens = if tokens.is_nan() { 0.0 } else { tokens.clamp(0.0, capacity) };
    (tokens + elapsed_secs * rate).min(capacity)
}
