//! Per-resource advisory locks.
//!
//! `acquire` is a single `set_if_absent` with TTL: contention returns `false`
//! immediately and the caller decides whether to retry. The TTL bounds how
//! long a crashed holder can block a resource. Release compares the stored
//! holder with the caller's node id, so a node cannot drop a lock it lost to
//! expiry and someone else re-acquired.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use flowguard_core::{CoreResult, NodeId, require_non_empty};

use crate::keys::KeySpace;
use crate::local::LocalNode;
use crate::store::{SharedStore, StoreResult};

/// Result of running a closure under a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was held; the closure ran and the lock was released.
    Acquired(T),
    /// Another holder owns the resource (or the store was unreachable).
    Busy,
}

impl<T> LockOutcome<T> {
    pub fn acquired(self) -> Option<T> {
        match self {
            LockOutcome::Acquired(v) => Some(v),
            LockOutcome::Busy => None,
        }
    }
}

/// A lock entry currently present in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLock {
    pub resource_key: String,
    pub holder: Option<NodeId>,
}

#[derive(Clone)]
pub struct DistributedLock {
    store: SharedStore,
    keys: KeySpace,
    local: Arc<LocalNode>,
}

impl DistributedLock {
    pub fn new(store: SharedStore, keys: KeySpace, local: Arc<LocalNode>) -> Self {
        Self { store, keys, local }
    }

    /// Try once to take the lock for `resource_key`.
    ///
    /// Returns `Ok(false)` on contention, while draining, or when the store is
    /// unreachable. Only an empty key is an error.
    pub fn acquire(&self, resource_key: &str, ttl: Duration) -> CoreResult<bool> {
        require_non_empty("resource_key", resource_key)?;
        let node_id = self.local.id().as_str();

        if self.local.is_draining() {
            debug!(node_id, resource_key, "draining; lock not requested");
            return Ok(false);
        }

        match self.store.set_if_absent(&self.keys.lock(resource_key), node_id, ttl) {
            Ok(acquired) => {
                debug!(node_id, resource_key, acquired, "lock acquire");
                Ok(acquired)
            }
            Err(e) => {
                warn!(node_id, resource_key, error = %e, "lock acquire failed");
                Ok(false)
            }
        }
    }

    /// Release the lock if this node is the recorded holder.
    pub fn release(&self, resource_key: &str) -> CoreResult<bool> {
        require_non_empty("resource_key", resource_key)?;
        let node_id = self.local.id().as_str();

        match self.store.delete_if_equals(&self.keys.lock(resource_key), node_id) {
            Ok(released) => {
                debug!(node_id, resource_key, released, "lock release");
                Ok(released)
            }
            Err(e) => {
                warn!(node_id, resource_key, error = %e, "lock release failed; entry will expire");
                Ok(false)
            }
        }
    }

    pub fn is_locked(&self, resource_key: &str) -> CoreResult<bool> {
        Ok(self.holder(resource_key)?.is_some())
    }

    /// Node currently holding `resource_key`, if any.
    pub fn holder(&self, resource_key: &str) -> CoreResult<Option<NodeId>> {
        require_non_empty("resource_key", resource_key)?;
        match self.store.get(&self.keys.lock(resource_key)) {
            Ok(value) => Ok(value.and_then(|v| v.parse().ok())),
            Err(e) => {
                warn!(resource_key, error = %e, "lock lookup failed");
                Ok(None)
            }
        }
    }

    /// Every live lock in the key space, sorted by resource key.
    pub fn held_locks(&self) -> StoreResult<Vec<HeldLock>> {
        let prefix = self.keys.lock("");
        let keys = self.store.keys(&self.keys.lock_pattern())?;

        let mut locks = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(resource_key) = key.strip_prefix(&prefix) else {
                continue;
            };
            // Released or expired between the listing and this read.
            let Ok(Some(value)) = self.store.get(&key) else {
                continue;
            };
            locks.push(HeldLock {
                resource_key: resource_key.to_string(),
                holder: value.parse().ok(),
            });
        }
        Ok(locks)
    }

    /// Run `f` while holding the lock; the lock is always released afterwards.
    pub fn with_lock<T>(
        &self,
        resource_key: &str,
        ttl: Duration,
        f: impl FnOnce() -> T,
    ) -> CoreResult<LockOutcome<T>> {
        if !self.acquire(resource_key, ttl)? {
            return Ok(LockOutcome::Busy);
        }

        let _guard = ReleaseOnDrop {
            lock: self,
            resource_key,
        };
        Ok(LockOutcome::Acquired(f()))
    }
}

/// Releases on scope exit, including unwinding out of the closure.
struct ReleaseOnDrop<'a> {
    lock: &'a DistributedLock,
    resource_key: &'a str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release(self.resource_key);
    }
}
