//! Error types for admission control.
//!
//! Only [`ConfigError`] is ever returned to the caller of the engine; the other kinds are
//! absorbed by the engine and tiered storage and turned into a [`crate::Decision`].
use std::time::Duration;
use thiserror::Error;

use crate::config::AlgorithmKind;
use crate::decision::Decision;
use crate::throttle::ThrottleConfigError;

/// Invalid limiter configuration. Always fatal to the configuration being built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("limiter name must not be empty")]
    EmptyName,
    #[error("requests must be > 0")]
    ZeroRequests,
    #[error("window must be > 0")]
    ZeroWindow,
    #[error("sliding window must be at least 1s (got {0:?})")]
    SubSecondWindow(Duration),
    #[error("capacity must be >= 1 (got {0})")]
    InvalidCapacity(u64),
    #[error("refill rate must be a finite value > 0 (got {0})")]
    InvalidRefillRate(f64),
    #[error("`{field}` does not apply to the {algorithm} algorithm")]
    NotApplicable { field: &'static str, algorithm: AlgorithmKind },
    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("unknown fail strategy `{0}`")]
    UnknownFailStrategy(String),
    #[error(transparent)]
    Throttle(#[from] ThrottleConfigError),
}

/// The key resolver could not produce a key for a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyResolutionError {
    #[error("no key could be derived from the request context")]
    Missing,
    #[error("resolved key rejected by key policy: {0}")]
    Rejected(String),
    #[error("key resolution failed: {0}")]
    Failed(String),
}

/// A state store could not complete an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt state for key `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Outcome of running an operation through a circuit breaker.
///
/// `Open` and `ProbeLimit` mean the operation was never attempted; `Inner` means it ran
/// and failed. Tiered storage uses this distinction to decide how to fall back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open ({failure_count} failures, retry in {retry_in:?})")]
    Open { failure_count: u32, retry_in: Duration },
    #[error("circuit breaker half-open probe limit reached ({in_flight} in flight, max {max})")]
    ProbeLimit { in_flight: usize, max: usize },
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Rejected because the circuit is open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Rejected because all half-open probe slots were taken.
    pub fn is_probe_limit(&self) -> bool {
        matches!(self, Self::ProbeLimit { .. })
    }

    /// The breaker refused without attempting the operation.
    pub fn is_fast_fail(&self) -> bool {
        !matches!(self, Self::Inner(_))
    }

    /// Get the inner error if the operation ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by [`AdmissionService`](crate::layer::AdmissionService).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError<E> {
    /// The limiter denied the request; the decision carries the reset time.
    #[error("request rejected by limiter `{}`", .0.limiter_name())]
    Rejected(Decision),
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> AdmissionError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(decision) => Some(decision),
            Self::Inner(_) => None,
        }
    }
}
