#![allow(dead_code)]

use async_trait::async_trait;
use quotaguard::algorithm::AlgorithmState;
use quotaguard::storage::Diagnostics;
use quotaguard::{LimiterConfig, StorageError, StorageProvider, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

/// Store that wraps another and can be switched off, failing every call while down.
/// Acquires alone can also be made to time out while the clock keeps answering.
#[derive(Debug)]
pub struct SwitchableStorage<S> {
    inner: S,
    down: AtomicBool,
    acquire_down: AtomicBool,
    calls: AtomicU64,
}

impl<S> SwitchableStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            acquire_down: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_acquire_down(&self, down: bool) {
        self.acquire_down.store(down, Ordering::SeqCst);
    }

    /// Calls that reached this store, successful or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: StorageProvider> StorageProvider for SwitchableStorage<S> {
    async fn current_time(&self) -> Result<Timestamp, StorageError> {
        self.check()?;
        self.inner.current_time().await
    }

    async fn try_acquire_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
        permits: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        self.check()?;
        if self.acquire_down.load(Ordering::SeqCst) {
            return Err(StorageError::Timeout(Duration::from_millis(50)));
        }
        self.inner.try_acquire_permits(key, config, permits, now).await
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.reset(key).await
    }

    async fn get_state(&self, key: &str) -> Result<Option<AlgorithmState>, StorageError> {
        self.check()?;
        self.inner.get_state(key).await
    }

    async fn is_healthy(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && self.inner.is_healthy().await
    }

    async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.inner.diagnostics().await;
        diagnostics.insert("down".into(), self.down.load(Ordering::SeqCst).into());
        diagnostics
    }
}

/// A store whose clock works but whose acquires always time out.
pub fn timing_out_storage() -> SwitchableStorage<quotaguard::InMemoryStorage> {
    let storage = SwitchableStorage::new(quotaguard::InMemoryStorage::new());
    storage.set_acquire_down(true);
    storage
}

/// A store that is permanently down.
pub fn failing_storage() -> SwitchableStorage<quotaguard::InMemoryStorage> {
    let storage = SwitchableStorage::new(quotaguard::InMemoryStorage::new());
    storage.set_down(true);
    storage
}

/// Captures formatted tracing output for assertions.
#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install a subscriber writing into the returned buffer for the current thread.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    (writer, tracing::subscriber::set_default(subscriber))
}
