//! Metrics and audit collaborators for the limiter engine.
//!
//! Both are injected as trait objects so hosts can bridge them to whatever metrics or
//! audit pipeline they already run. The crate ships:
//!
//! - [`NoopMetrics`] and [`CountingMetrics`] for [`MetricsExporter`].
//! - [`NullAudit`], [`LogAudit`], [`MemoryAudit`] and [`NonBlockingAudit`] for
//!   [`AuditLogger`].
//!
//! Implementations are called inline on the admission path. They must not block; wrap a
//! slow logger in [`NonBlockingAudit`] to move delivery onto a background task.

pub mod audit;
pub mod metrics;

pub use audit::{
    AuditEvent, AuditLogger, ConfigChange, LogAudit, MemoryAudit, NonBlockingAudit, NullAudit,
};
pub use metrics::{CountingMetrics, MetricsExporter, NoopMetrics};
