//! In-memory coordination store for tests/dev.
//!
//! One instance shared through `Arc` stands in for the cluster-wide store, so
//! several simulated nodes in one process contend exactly as they would
//! against Redis. Expiry is evaluated against an injected [`Clock`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use flowguard_core::{Clock, SystemClock};

use super::{CoordinationStore, StoreError, StoreResult, pattern_matches};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct InMemoryCoordinationStore {
    clock: Arc<dyn Clock>,
    values: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    available: AtomicBool,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            values: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.clock.now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Lock the value map and drop anything that has expired.
    fn live_values(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.check_available()?;
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Backend("value map lock poisoned".to_string()))?;
        let now = self.clock.now();
        values.retain(|_, entry| entry.is_live(now));
        Ok(values)
    }

    fn hashes(&self) -> StoreResult<MutexGuard<'_, HashMap<String, HashMap<String, String>>>> {
        self.check_available()?;
        self.hashes
            .lock()
            .map_err(|_| StoreError::Backend("hash map lock poisoned".to_string()))
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinationStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut values = self.live_values()?;
        if values.contains_key(key) {
            return Ok(false);
        }
        values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at = self.expiry(ttl);
        let mut values = self.live_values()?;
        values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let values = self.live_values()?;
        Ok(values.get(key).map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut values = self.live_values()?;
        Ok(values.remove(key).is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut values = self.live_values()?;
        match values.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn hash_put(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut hashes = self.hashes()?;
        hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hash_get(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        let hashes = self.hashes()?;
        Ok(hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    fn hash_entries(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        let hashes = self.hashes()?;
        Ok(hashes.get(hash).cloned().unwrap_or_default())
    }

    fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let mut hashes = self.hashes()?;
        Ok(hashes
            .get_mut(hash)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let values = self.live_values()?;
        let mut keys: Vec<String> = values
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut values = self.live_values()?;
        match values.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut values = self.live_values()?;
        match values.get(key) {
            Some(entry) if entry.value == expected => {
                values.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
