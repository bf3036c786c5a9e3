use serde::Serialize;
use std::time::Duration;

use crate::clock::Timestamp;
use crate::config::LimiterConfig;

/// Reason attached to a denial by the limiter itself.
pub const REASON_RATE_LIMITED: &str = "rate_limit_exceeded";
/// Reason attached when storage failed and the fail strategy decided.
pub const REASON_STORAGE_UNAVAILABLE: &str = "storage_unavailable";

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    allowed: bool,
    limiter_name: String,
    limit: u64,
    remaining: u64,
    reset_time: Timestamp,
    delay_ms: u64,
    reason: Option<String>,
}

impl Decision {
    /// Admitted request.
    pub fn allow(config: &LimiterConfig, remaining: u64, reset_time: Timestamp) -> Self {
        Self {
            allowed: true,
            limiter_name: config.name().to_owned(),
            limit: config.capacity(),
            remaining,
            reset_time,
            delay_ms: 0,
            reason: None,
        }
    }

    /// Denied request.
    pub fn deny(
        config: &LimiterConfig,
        reset_time: Timestamp,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            limiter_name: config.name().to_owned(),
            limit: config.capacity(),
            remaining: 0,
            reset_time,
            delay_ms: 0,
            reason: Some(reason.into()),
        }
    }

    /// Ask the caller to wait `delay` before proceeding. Ignored on denials.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if self.allowed {
            self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        }
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn limiter_name(&self) -> &str {
        &self.limiter_name
    }

    /// The limit `remaining` counts down from: bucket capacity for token buckets,
    /// requests per window for sliding windows.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// When the limiter is expected to be fully replenished, in store milliseconds.
    pub fn reset_time(&self) -> Timestamp {
        self.reset_time
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}
