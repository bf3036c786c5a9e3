use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::FailStrategy;

/// What happened to a registered limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChange {
    Registered,
    Updated,
    Removed,
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigChange::Registered => write!(f, "registered"),
            ConfigChange::Updated => write!(f, "updated"),
            ConfigChange::Removed => write!(f, "removed"),
        }
    }
}

/// Structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request was denied by a limiter.
    Enforcement { limiter: String, key: String, reason: String },
    /// Storage failed and the limiter's fail strategy decided the outcome.
    Failure { limiter: String, key: String, error: String, fail_strategy: FailStrategy, allowed: bool },
    /// The key resolver failed; the request was charged to the shared anonymous bucket.
    KeyResolutionFailed { limiter: String, error: String },
    ConfigChanged { limiter: String, change: ConfigChange },
}

impl AuditEvent {
    pub fn limiter(&self) -> &str {
        match self {
            AuditEvent::Enforcement { limiter, .. }
            | AuditEvent::Failure { limiter, .. }
            | AuditEvent::KeyResolutionFailed { limiter, .. }
            | AuditEvent::ConfigChanged { limiter, .. } => limiter,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::Enforcement { limiter, key, reason } => {
                write!(f, "Enforcement(limiter={limiter}, key={key}, reason={reason})")
            }
            AuditEvent::Failure { limiter, key, error, fail_strategy, allowed } => write!(
                f,
                "Failure(limiter={limiter}, key={key}, strategy={fail_strategy}, allowed={allowed}, error={error})"
            ),
            AuditEvent::KeyResolutionFailed { limiter, error } => {
                write!(f, "KeyResolutionFailed(limiter={limiter}, error={error})")
            }
            AuditEvent::ConfigChanged { limiter, change } => {
                write!(f, "ConfigChanged(limiter={limiter}, change={change})")
            }
        }
    }
}

/// Receives audit events. Must not block the caller.
pub trait AuditLogger: Send + Sync + fmt::Debug {
    fn log(&self, event: AuditEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAudit;

impl AuditLogger for NullAudit {
    fn log(&self, _event: AuditEvent) {}
}

/// Writes events through `tracing` under the `quotaguard::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAudit;

impl AuditLogger for LogAudit {
    fn log(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Failure { .. } | AuditEvent::KeyResolutionFailed { .. } => {
                tracing::warn!(target: "quotaguard::audit", event = %event, "audit_event");
            }
            _ => tracing::info!(target: "quotaguard::audit", event = %event, "audit_event"),
        }
    }
}

/// Keeps the most recent events in memory, evicting the oldest when full.
#[derive(Debug, Clone)]
pub struct MemoryAudit {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.with_events(|events| events.iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.with_events(|events| events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.with_events(|events| events.clear());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn with_events<R>(&self, f: impl FnOnce(&mut VecDeque<AuditEvent>) -> R) -> R {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Default for MemoryAudit {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger for MemoryAudit {
    fn log(&self, event: AuditEvent) {
        let capacity = self.capacity;
        let evicted = self.with_events(|events| {
            let evicted = events.len() >= capacity;
            if evicted {
                events.pop_front();
            }
            events.push_back(event);
            evicted
        });
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Hands events to a background task through a bounded channel.
///
/// When the channel is full the event is dropped and counted rather than blocking the
/// admission path. Must be constructed inside a Tokio runtime.
#[derive(Debug, Clone)]
pub struct NonBlockingAudit {
    tx: tokio::sync::mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingAudit {
    pub fn with_capacity<L>(inner: L, capacity: usize) -> Self
    where
        L: AuditLogger + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.log(event);
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditLogger for NonBlockingAudit {
    fn log(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn denied(n: usize) -> AuditEvent {
        AuditEvent::Enforcement {
            limiter: "api".into(),
            key: format!("user-{n}"),
            reason: "rate_limit_exceeded".into(),
        }
    }

    #[test]
    fn memory_audit_evicts_oldest() {
        let audit = MemoryAudit::with_capacity(2);
        for n in 0..3 {
            audit.log(denied(n));
        }
        assert_eq!(audit.len(), 2);
        assert_eq!(audit.evicted(), 1);
        assert_eq!(audit.events(), vec![denied(1), denied(2)]);

        audit.clear();
        assert!(audit.is_empty());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = AuditEvent::Failure {
            limiter: "api".into(),
            key: "api:alice".into(),
            error: "storage unavailable: refused".into(),
            fail_strategy: FailStrategy::FailClosed,
            allowed: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failure");
        assert_eq!(json["fail_strategy"], "fail_closed");
        assert_eq!(json["allowed"], false);
        assert_eq!(event.limiter(), "api");
    }

    #[test]
    fn display_is_compact() {
        let event = AuditEvent::ConfigChanged { limiter: "api".into(), change: ConfigChange::Updated };
        assert_eq!(event.to_string(), "ConfigChanged(limiter=api, change=updated)");
    }

    #[tokio::test]
    async fn non_blocking_audit_delivers_in_background() {
        let memory = MemoryAudit::new();
        let audit = NonBlockingAudit::with_capacity(memory.clone(), 16);
        audit.log(denied(0));
        audit.log(denied(1));

        for _ in 0..50 {
            if memory.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(memory.events(), vec![denied(0), denied(1)]);
        assert_eq!(audit.dropped(), 0);
    }

    #[tokio::test]
    async fn non_blocking_audit_counts_drops_when_full() {
        let audit = NonBlockingAudit::with_capacity(NullAudit, 1);
        // current-thread runtime: the worker cannot drain until we yield
        for n in 0..10 {
            audit.log(denied(n));
        }
        assert_eq!(audit.dropped(), 9);
    }
}
