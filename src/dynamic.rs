//! Live-updatable shared values.
//!
//! Readers take a cheap `Arc` snapshot without locking; writers swap in a whole new
//! value. A reader that already holds a snapshot keeps seeing it, so one admission check
//! never observes half of an update.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a value that can be replaced at runtime. Clones share the value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value, returning the previous one.
    pub fn set(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    /// Derive a new value from the current one, retrying if another writer got there
    /// first. `f` may run more than once.
    pub fn update<F>(&self, mut f: F) -> Arc<T>
    where
        F: FnMut(&T) -> T,
    {
        self.inner.rcu(|current| f(current));
        self.inner.load_full()
    }

    /// Like [`update`](Self::update), but `f` may refuse the change. On error the value
    /// is left untouched.
    pub fn try_update<F, E>(&self, mut f: F) -> Result<Arc<T>, E>
    where
        F: FnMut(&T) -> Result<T, E>,
    {
        loop {
            let current = self.inner.load_full();
            let next = Arc::new(f(&current)?);
            let previous = self.inner.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&*previous, &current) {
                return Ok(next);
            }
        }
    }
}
