//! Adaptive throttling: graduated delay before outright rejection.
//!
//! Below the soft limit a request passes untouched. Between the soft limit and the hard
//! limit the caller is asked to wait, proportionally (`Linear`) or quadratically
//! (`Exponential`) to how deep into the band the current usage sits.
//!
//! ```
//! use quotaguard::throttle::{calculate_delay, ThrottleStrategy};
//! use std::time::Duration;
//!
//! let max = Duration::from_millis(2000);
//! assert_eq!(calculate_delay(80, 100, 80, max, ThrottleStrategy::Linear), Duration::ZERO);
//! assert_eq!(calculate_delay(90, 100, 80, max, ThrottleStrategy::Linear), Duration::from_millis(1000));
//! assert_eq!(calculate_delay(90, 100, 80, max, ThrottleStrategy::Exponential), Duration::from_millis(500));
//! ```
//!
//! The calculator holds no state and is safe to call from any thread.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Shape of the delay curve between the soft and the hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleStrategy {
    /// `delay = ratio * max_delay`
    Linear,
    /// `delay = ratio² * max_delay`
    Exponential,
}

impl fmt::Display for ThrottleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleStrategy::Linear => write!(f, "linear"),
            ThrottleStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Errors returned when validating a [`ThrottleConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleConfigError {
    #[error("soft limit percent must be in 1..=99 (got {0})")]
    SoftLimitOutOfRange(u8),
    #[error("max delay must be greater than zero")]
    ZeroMaxDelay,
}

/// Validated throttling parameters attached to a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    soft_limit_percent: u8,
    max_delay: Duration,
    strategy: ThrottleStrategy,
}

impl ThrottleConfig {
    /// Create a throttle config. The soft limit must leave room below 100% so the
    /// throttling band is non-empty.
    pub fn new(
        soft_limit_percent: u8,
        max_delay: Duration,
        strategy: ThrottleStrategy,
    ) -> Result<Self, ThrottleConfigError> {
        if soft_limit_percent == 0 || soft_limit_percent >= 100 {
            return Err(ThrottleConfigError::SoftLimitOutOfRange(soft_limit_percent));
        }
        if max_delay.is_zero() {
            return Err(ThrottleConfigError::ZeroMaxDelay);
        }
        Ok(Self { soft_limit_percent, max_delay, strategy })
    }

    pub fn soft_limit_percent(&self) -> u8 {
        self.soft_limit_percent
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn strategy(&self) -> ThrottleStrategy {
        self.strategy
    }

    /// Delay for `current_usage` out of `limit` under this config.
    pub fn delay_for(&self, current_usage: u64, limit: u64) -> Duration {
        calculate_delay(current_usage, limit, self.soft_limit_percent, self.max_delay, self.strategy)
    }
}

/// Compute the throttle delay for a request.
///
/// Returns zero below `soft_limit_percent` of `limit`, and for degenerate inputs
/// (`limit == 0` or a soft limit at or above 100%) where no throttling band exists.
/// At or above `limit` the full `max_delay` is returned; rejecting such requests is the
/// engine's job, not the calculator's.
pub fn calculate_delay(
    current_usage: u64,
    limit: u64,
    soft_limit_percent: u8,
    max_delay: Duration,
    strategy: ThrottleStrategy,
) -> Duration {
    if limit == 0 || soft_limit_percent >= 100 {
        return Duration::ZERO;
    }
    let limit = limit as f64;
    let usage = current_usage as f64;
    let soft_limit = limit * f64::from(soft_limit_percent) / 100.0;
    if usage < soft_limit {
        return Duration::ZERO;
    }

    let ratio = ((usage - soft_limit) / (limit - soft_limit)).clamp(0.0, 1.0);
    let factor = match strategy {
        ThrottleStrategy::Linear => ratio,
        ThrottleStrategy::Exponential => ratio * ratio,
    };
    // f64 rounding can push huge delays past Duration's range.
    Duration::try_from_secs_f64(max_delay.as_secs_f64() * factor)
        .map_or(max_delay, |delay| delay.min(max_delay))
}
