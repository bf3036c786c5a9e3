//! Limiter configuration.
//!
//! A [`LimiterConfig`] is immutable once built and validated up front: invalid values are
//! rejected with a [`ConfigError`], never silently clamped.
//!
//! ```
//! use quotaguard::config::{AlgorithmKind, FailStrategy, LimiterConfig};
//! use std::time::Duration;
//!
//! let config = LimiterConfig::builder("api", AlgorithmKind::TokenBucket)
//!     .requests(100)
//!     .window(Duration::from_secs(60))
//!     .capacity(20)
//!     .fail_strategy(FailStrategy::FailClosed)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.ttl(), Duration::from_secs(120));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::throttle::{ThrottleConfig, ThrottleStrategy};

/// Admission algorithm used by a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmKind::TokenBucket => write!(f, "token bucket"),
            AlgorithmKind::SlidingWindow => write!(f, "sliding window"),
        }
    }
}

impl FromStr for AlgorithmKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            _ => Err(ConfigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// What to do when the enforcement mechanism itself is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStrategy {
    /// Admit the request (availability over consistency).
    #[default]
    FailOpen,
    /// Reject the request (consistency over availability).
    FailClosed,
}

impl FailStrategy {
    /// Admission verdict to use when no store could be consulted.
    pub fn admits(self) -> bool {
        matches!(self, FailStrategy::FailOpen)
    }
}

impl fmt::Display for FailStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailStrategy::FailOpen => write!(f, "fail-open"),
            FailStrategy::FailClosed => write!(f, "fail-closed"),
        }
    }
}

impl FromStr for FailStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "fail_open" | "open" => Ok(FailStrategy::FailOpen),
            "fail_closed" | "closed" => Ok(FailStrategy::FailClosed),
            _ => Err(ConfigError::UnknownFailStrategy(s.to_string())),
        }
    }
}

/// Validated, immutable configuration shared by every request of one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    name: String,
    algorithm: AlgorithmKind,
    requests: u64,
    window: Duration,
    fail_strategy: FailStrategy,
    capacity: u64,
    refill_rate: f64,
    ttl: Duration,
    throttle: Option<ThrottleConfig>,
}

impl LimiterConfig {
    /// Start building a configuration.
    pub fn builder(name: impl Into<String>, algorithm: AlgorithmKind) -> LimiterConfigBuilder {
        LimiterConfigBuilder {
            name: name.into(),
            algorithm,
            requests: 0,
            window: Duration::ZERO,
            fail_strategy: FailStrategy::default(),
            capacity: None,
            refill_rate: None,
            throttle: None,
        }
    }

    /// Token bucket admitting `requests` per `window`, with a full-size burst.
    pub fn token_bucket(
        name: impl Into<String>,
        requests: u64,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        Self::builder(name, AlgorithmKind::TokenBucket).requests(requests).window(window).build()
    }

    /// Sliding window admitting `requests` per `window`.
    pub fn sliding_window(
        name: impl Into<String>,
        requests: u64,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        Self::builder(name, AlgorithmKind::SlidingWindow).requests(requests).window(window).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn fail_strategy(&self) -> FailStrategy {
        self.fail_strategy
    }

    /// Bucket capacity. Equals `requests` for sliding window limiters.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// How long idle state is retained: `2 × window`, saturating at `Duration::MAX`.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn throttle(&self) -> Option<&ThrottleConfig> {
        self.throttle.as_ref()
    }

    /// Copy of this config with a different fail strategy.
    pub fn with_fail_strategy(&self, fail_strategy: FailStrategy) -> Self {
        Self { fail_strategy, ..self.clone() }
    }
}

/// Builder for [`LimiterConfig`]; see [`LimiterConfig::builder`].
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    name: String,
    algorithm: AlgorithmKind,
    requests: u64,
    window: Duration,
    fail_strategy: FailStrategy,
    capacity: Option<u64>,
    refill_rate: Option<f64>,
    throttle: Option<ThrottleConfig>,
}

impl LimiterConfigBuilder {
    pub fn requests(mut self, requests: u64) -> Self {
        self.requests = requests;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn fail_strategy(mut self, fail_strategy: FailStrategy) -> Self {
        self.fail_strategy = fail_strategy;
        self
    }

    /// Token bucket only. Defaults to `requests`.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Token bucket only, in tokens per second. Defaults to `requests / window`.
    pub fn refill_rate(mut self, tokens_per_sec: f64) -> Self {
        self.refill_rate = Some(tokens_per_sec);
        self
    }

    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.requests == 0 {
            return Err(ConfigError::ZeroRequests);
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }

        let (capacity, refill_rate) = match self.algorithm {
            AlgorithmKind::TokenBucket => {
                let capacity = self.capacity.unwrap_or(self.requests);
                if capacity < 1 {
                    return Err(ConfigError::InvalidCapacity(capacity));
                }
                let refill_rate = self
                    .refill_rate
                    .unwrap_or_else(|| self.requests as f64 / self.window.as_secs_f64());
                if !refill_rate.is_finite() || refill_rate <= 0.0 {
                    return Err(ConfigError::InvalidRefillRate(refill_rate));
                }
                (capacity, refill_rate)
            }
            AlgorithmKind::SlidingWindow => {
                if self.window < Duration::from_secs(1) {
                    return Err(ConfigError::SubSecondWindow(self.window));
                }
                if self.capacity.is_some() {
                    return Err(ConfigError::NotApplicable {
                        field: "capacity",
                        algorithm: self.algorithm,
                    });
                }
                if self.refill_rate.is_some() {
                    return Err(ConfigError::NotApplicable {
                        field: "refill_rate",
                        algorithm: self.algorithm,
                    });
                }
                (self.requests, self.requests as f64 / self.window.as_secs_f64())
            }
        };

        Ok(LimiterConfig {
            name: self.name,
            algorithm: self.algorithm,
            requests: self.requests,
            window: self.window,
            fail_strategy: self.fail_strategy,
            capacity,
            refill_rate,
            ttl: self.window.checked_mul(2).unwrap_or(Duration::MAX),
            throttle: self.throttle,
        })
    }
}

/// Unvalidated configuration as read from a file; durations are integer milliseconds.
///
/// ```
/// use quotaguard::config::{LimiterConfig, RawLimiterConfig};
///
/// let raw: RawLimiterConfig = serde_json::from_str(
///     r#"{"name":"login","algorithm":"sliding_window","requests":5,"window_ms":60000,
///         "fail_strategy":"fail_closed"}"#,
/// ).unwrap();
/// let config = LimiterConfig::try_from(raw).unwrap();
/// assert_eq!(config.requests(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLimiterConfig {
    pub name: String,
    pub algorithm: AlgorithmKind,
    pub requests: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub fail_strategy: FailStrategy,
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub throttle: Option<RawThrottleConfig>,
}

/// Unvalidated throttle section of a [`RawLimiterConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawThrottleConfig {
    pub soft_limit_percent: u8,
    pub max_delay_ms: u64,
    pub strategy: ThrottleStrategy,
}

impl TryFrom<RawLimiterConfig> for LimiterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLimiterConfig) -> Result<Self, Self::Error> {
        let mut builder = LimiterConfig::builder(raw.name, raw.algorithm)
            .requests(raw.requests)
            .window(Duration::from_millis(raw.window_ms))
            .fail_strategy(raw.fail_strategy);
        if let Some(capacity) = raw.capacity {
            builder = builder.capacity(capacity);
        }
        if let Some(rate) = raw.refill_rate {
            builder = builder.refill_rate(rate);
        }
        if let Some(t) = raw.throttle {
            builder = builder.throttle(ThrottleConfig::new(
                t.soft_limit_percent,
                Duration::from_millis(t.max_delay_ms),
                t.strategy,
            )?);
        }
        builder.build()
    }
}
