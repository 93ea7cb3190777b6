//! Per-resource locking with ordered multi-resource acquisition
//!
//! Each canonical path gets its own async mutex, created on first use. Every
//! multi-key acquisition takes keys in ascending order, so two callers with
//! overlapping key sets can never wait on each other in a cycle. A slot is
//! dropped from the registry once no holder or waiter references it.

use crate::error::{Error, LockError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Canonical identifier of one lockable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub(crate) fn from_canonical(path: &Path) -> Self {
        Self(path.to_string_lossy().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Slot = Arc<AsyncMutex<()>>;

/// Registry of resource locks
pub struct LockManager {
    slots: Mutex<HashMap<LockKey, Slot>>,
    timeout: Duration,
}

/// Locks held for the duration of one call.
///
/// Dropping the set releases every lock in reverse acquisition order.
pub struct LockSet<'a> {
    manager: &'a LockManager,
    held: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl LockSet<'_> {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.held.iter().map(|(key, _)| key)
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.held.pop() {
            drop(guard);
            self.manager.release_slot(&key);
            debug!("Released lock: {}", key);
        }
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of keys currently held or waited on
    pub fn tracked_keys(&self) -> usize {
        self.slots.lock().len()
    }

    /// Run `op` while holding the lock for `key`
    pub async fn with_lock<T, F, Fut>(&self, key: &LockKey, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _held = self.acquire(std::slice::from_ref(key)).await?;
        op().await
    }

    /// Run `op` while holding the locks for all `keys`
    pub async fn with_locks<T, F, Fut>(&self, keys: &[LockKey], op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _held = self.acquire(keys).await?;
        op().await
    }

    /// Acquire every distinct key in ascending order.
    ///
    /// If any acquisition times out, the locks taken so far are released in
    /// reverse order and `ResourceBusy` is returned.
    pub async fn acquire(&self, keys: &[LockKey]) -> Result<LockSet<'_>> {
        let ordered: BTreeSet<&LockKey> = keys.iter().collect();
        let mut set = LockSet {
            manager: self,
            held: Vec::with_capacity(ordered.len()),
        };

        for key in ordered {
            let guard = self.acquire_one(key).await?;
            debug!("Acquired lock: {}", key);
            set.held.push((key.clone(), guard));
        }

        Ok(set)
    }

    async fn acquire_one(&self, key: &LockKey) -> Result<OwnedMutexGuard<()>> {
        let slot = self.slot(key);

        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.release_slot(key);
                warn!("Timed out after {:?} waiting for lock: {}", self.timeout, key);
                Err(Error::Lock(LockError::Timeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                }))
            }
        }
    }

    fn slot(&self, key: &LockKey) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Forget a slot nobody else references.
    ///
    /// New references are only handed out under the registry lock, so a
    /// count of one here cannot race with a new waiter.
    fn release_slot(&self, key: &LockKey) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(key);
            }
        }
    }
}
