//! Jitter for circuit-breaker recovery deadlines.
//!
//! When many nodes trip their breakers against the same failing backend at roughly the
//! same moment, a fixed recovery timeout makes them all probe it again in lockstep. A
//! proportional jitter spreads those probes over `base × (1 ± factor)`.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected
//!   via [`Jitter::apply_with_rng`].
//! - Precision: results that do not fit in a [`Duration`] saturate to `Duration::MAX`.
//!
//! ```rust
//! use quotaguard::jitter::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::proportional(0.3).unwrap();
//! let base = Duration::from_secs(30);
//! let (low, high) = jitter.bounds(base);
//! let sample = jitter.apply(base);
//! assert!(sample >= low && sample <= high);
//! ```

use rand::{rng, Rng};
use std::time::Duration;
use thiserror::Error;

/// Rejected jitter factor.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("jitter factor must be finite and in [0, 1) (got {0})")]
pub struct InvalidJitterFactor(pub f64);

/// Jitter strategy for randomizing a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// Use the base duration unchanged.
    #[default]
    None,
    /// Scale by `1 + factor × U(-1, 1)`.
    Proportional(f64),
}

impl Jitter {
    /// Proportional jitter. `factor` must be in `[0, 1)` so the result stays positive.
    pub fn proportional(factor: f64) -> Result<Self, InvalidJitterFactor> {
        if !factor.is_finite() || !(0.0..1.0).contains(&factor) {
            return Err(InvalidJitterFactor(factor));
        }
        if factor == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Proportional(factor))
    }

    pub fn factor(&self) -> f64 {
        match self {
            Jitter::None => 0.0,
            Jitter::Proportional(factor) => *factor,
        }
    }

    /// Randomize `base` using the thread-local RNG.
    pub fn apply(&self, base: Duration) -> Duration {
        self.apply_with_rng(base, &mut rng())
    }

    /// Randomize `base` with a caller-supplied RNG (seeded in tests).
    pub fn apply_with_rng<R: Rng>(&self, base: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => base,
            Jitter::Proportional(factor) => {
                let offset = rng.random_range(-1.0f64..=1.0) * *factor;
                scale(base, 1.0 + offset)
            }
        }
    }

    /// Smallest and largest duration [`apply`](Self::apply) can return for `base`.
    pub fn bounds(&self, base: Duration) -> (Duration, Duration) {
        let factor = self.factor();
        (scale(base, 1.0 - factor), scale(base, 1.0 + factor))
    }
}

fn scale(base: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}
