use serde::{Deserialize, Serialize};

use crate::clock::{duration_millis, Timestamp};
use crate::config::LimiterConfig;

/// Two adjacent fixed windows: the current one starting at `window_start` and the one
/// immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub window_start: Timestamp,
    pub current_count: u64,
    pub previous_count: u64,
}

/// Rotate to `now` and try to admit `permits` requests.
///
/// The estimate is `previous × weight + current` where `weight` is the share of the
/// previous window still covered by a window-length interval ending at `now`. A request is
/// admitted while the estimate (plus any extra permits beyond the first) stays below
/// `requests`; denied requests do not count.
pub fn apply(
    prev: Option<&SlidingWindowState>,
    permits: u64,
    now: Timestamp,
    config: &LimiterConfig,
) -> (SlidingWindowState, bool) {
    let window = window_millis(config);
    let mut state = match prev {
        Some(s) => rotate(*s, now, window),
        None => SlidingWindowState {
            window_start: now - now % window,
            current_count: 0,
            previous_count: 0,
        },
    };

    let extra = permits.saturating_sub(1) as f64;
    if effective(&state, now, window) + extra < config.requests() as f64 {
        state.current_count = state.current_count.saturating_add(permits);
        (state, true)
    } else {
        (state, false)
    }
}

pub(crate) fn inspect(
    state: &SlidingWindowState,
    config: &LimiterConfig,
    now: Timestamp,
) -> super::Usage {
    let window = window_millis(config);
    let rotated = rotate(*state, now, window);
    let used = effective(&rotated, now, window);
    let limit = config.requests();

    super::Usage {
        used,
        limit,
        remaining: (limit as f64 - used).floor().max(0.0) as u64,
        reset_at: rotated.window_start.saturating_add(window),
    }
}

/// Advance `window_start` by whole windows. A gap of two or more windows leaves no
/// history behind, so both counts reset.
fn rotate(state: SlidingWindowState, now: Timestamp, window: u64) -> SlidingWindowState {
    let elapsed = now.saturating_sub(state.window_start);
    let windows = elapsed / window;
    match windows {
        0 => state,
        1 => SlidingWindowState {
            window_start: state.window_start + window,
            current_count: 0,
            previous_count: state.current_count,
        },
        n => SlidingWindowState {
            window_start: state.window_start + n * window,
            current_count: 0,
            previous_count: 0,
        },
    }
}

fn effective(state: &SlidingWindowState, now: Timestamp, window: u64) -> f64 {
    let into_window = now.saturating_sub(state.window_start) as f64;
    let window = window as f64;
    let weight = ((window - into_window) / window).max(0.0);
    state.previous_count as f64 * weight + state.current_count as f64
}

fn window_millis(config: &LimiterConfig) -> u64 {
    duration_millis(config.window()).max(1)
}
