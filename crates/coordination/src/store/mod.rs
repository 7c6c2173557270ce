//! Coordination store port.
//!
//! Every cross-node guarantee in this crate (one leader, one lock holder, node
//! liveness) is delegated to a shared key/value store offering atomic
//! set-if-absent with expiry. Nodes never talk to each other directly.
//!
//! All calls are synchronous round trips and may fail; callers treat
//! [`StoreError`] as "not acquired / not renewed" and retry on their next tick.

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use in_memory::InMemoryCoordinationStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCoordinationStore;

/// Shared handle used by every coordination component.
pub type SharedStore = Arc<dyn CoordinationStore>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, timeout, outage).
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the command failed.
    #[error("coordination store command failed: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value store shared by all nodes.
pub trait CoordinationStore: Send + Sync {
    /// Atomically create `key` with `value` and `ttl` unless it already exists.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Unconditionally write `key` with a TTL.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Returns true if a key was removed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    fn hash_put(&self, hash: &str, field: &str, value: &str) -> StoreResult<()>;

    fn hash_get(&self, hash: &str, field: &str) -> StoreResult<Option<String>>;

    fn hash_entries(&self, hash: &str) -> StoreResult<HashMap<String, String>>;

    fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool>;

    /// Live keys matching `pattern`. A trailing `*` matches any suffix.
    fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Reset the TTL of `key` only while it still holds `expected`.
    ///
    /// The default is a get-then-expire sequence: the key can expire and be
    /// taken by another node between the two calls. Adapters that can do the
    /// comparison server-side override this.
    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        match self.get(key)? {
            Some(current) if current == expected => self.expire(key, ttl),
            _ => Ok(false),
        }
    }

    /// Delete `key` only while it still holds `expected`.
    ///
    /// Same caveat as [`CoordinationStore::expire_if_equals`].
    fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        match self.get(key)? {
            Some(current) if current == expected => self.delete(key),
            _ => Ok(false),
        }
    }
}

/// Glob subset shared by the adapters: exact match or trailing `*`.
pub(crate) fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
