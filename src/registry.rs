//! Named limiter configurations that can be replaced at runtime.
//!
//! Each limiter is held in a [`DynamicConfig`], so an in-flight admission check keeps the
//! configuration it started with while later checks see the update. Every change is
//! reported to the audit logger as [`AuditEvent::ConfigChanged`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::LimiterConfig;
use crate::dynamic::DynamicConfig;
use crate::error::ConfigError;
use crate::telemetry::{AuditEvent, AuditLogger, ConfigChange, NullAudit};

/// Errors from [`LimiterRegistry`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("limiter `{name}` is not registered")]
    NotFound { name: String },
    #[error("update renamed limiter `{expected}` to `{found}`")]
    NameMismatch { expected: String, found: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Registry of live limiter configurations. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct LimiterRegistry {
    limiters: Arc<RwLock<HashMap<String, DynamicConfig<LimiterConfig>>>>,
    audit: Arc<dyn AuditLogger>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::with_audit(Arc::new(NullAudit))
    }

    pub fn with_audit(audit: Arc<dyn AuditLogger>) -> Self {
        Self { limiters: Arc::new(RwLock::new(HashMap::new())), audit }
    }

    /// Register `config` under its name. Registering an existing name replaces it in
    /// place, so holders of its handle see the new config.
    pub fn register(&self, config: LimiterConfig) -> DynamicConfig<LimiterConfig> {
        let name = config.name().to_owned();
        let mut limiters = self.write();
        let (handle, change) = match limiters.get(&name) {
            Some(existing) => {
                warn!(limiter = %name, "replacing registered limiter configuration");
                existing.set(config);
                (existing.clone(), ConfigChange::Updated)
            }
            None => {
                let handle = DynamicConfig::new(config);
                limiters.insert(name.clone(), handle.clone());
                info!(limiter = %name, "registered limiter");
                (handle, ConfigChange::Registered)
            }
        };
        drop(limiters);
        self.audit.log(AuditEvent::ConfigChanged { limiter: name, change });
        handle
    }

    /// Derive a new configuration for `name` from the current one.
    ///
    /// The closure may reject the change with a [`ConfigError`]; it may not rename the
    /// limiter.
    pub fn update<F>(&self, name: &str, mut f: F) -> Result<Arc<LimiterConfig>, RegistryError>
    where
        F: FnMut(&LimiterConfig) -> Result<LimiterConfig, ConfigError>,
    {
        let handle = self.handle(name).ok_or_else(|| RegistryError::NotFound { name: name.into() })?;
        let updated = handle.try_update(|current| {
            let next = f(current)?;
            if next.name() != name {
                return Err(RegistryError::NameMismatch {
                    expected: name.to_owned(),
                    found: next.name().to_owned(),
                });
            }
            Ok(next)
        })?;
        info!(limiter = %name, "updated limiter configuration");
        self.audit.log(AuditEvent::ConfigChanged {
            limiter: name.to_owned(),
            change: ConfigChange::Updated,
        });
        Ok(updated)
    }

    /// Current configuration for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<LimiterConfig>> {
        self.read().get(name).map(DynamicConfig::get)
    }

    /// Live handle for `name`; it follows later updates.
    pub fn handle(&self, name: &str) -> Option<DynamicConfig<LimiterConfig>> {
        self.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<LimiterConfig>> {
        let removed = self.write().remove(name)?;
        info!(limiter = %name, "removed limiter");
        self.audit.log(AuditEvent::ConfigChanged {
            limiter: name.to_owned(),
            change: ConfigChange::Removed,
        });
        Some(removed.get())
    }

    /// Registered limiter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DynamicConfig<LimiterConfig>>> {
        match self.limiters.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DynamicConfig<LimiterConfig>>> {
        match self.limiters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
