//! Keyed mutual exclusion for shared-parent mutations.
//!
//! Mutations that read-modify-write a list on a shared parent object (routes
//! on a router, security groups on a port) take the parent's lock first, so
//! two callers never both read the old list before either writes.
//!
//! Exclusion only holds between callers in this process that use the same
//! key string. It is not a distributed lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Table of named locks, created lazily and kept for the process lifetime.
///
/// Owned by the top-level process and passed by reference to every
/// operation that needs it.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock for `key` is free and take it.
    pub async fn lock(&self, key: &str) -> LockHandle {
        let mutex = self.entry(key);
        debug!("Acquiring lock {}", key);
        let guard = mutex.lock_owned().await;
        debug!("Acquired lock {}", key);
        LockHandle {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The lock is released when `f` finishes, whether it returns `Ok`,
    /// `Err` or unwinds.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.lock(key).await;
        let result = f().await;
        handle.release();
        result
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.locks.read().unwrap().get(key) {
            return Arc::clone(mutex);
        }
        let mut locks = self.locks.write().unwrap();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Ownership of one named lock. Released on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {
        debug!("Released lock {}", self.key);
    }
}
