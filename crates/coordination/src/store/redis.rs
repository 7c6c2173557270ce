//! Redis-backed coordination store (optional).
//!
//! Uses plain Redis primitives:
//! - `SET key value NX PX ttl` for leases and locks
//! - `PEXPIRE` for heartbeat refresh
//! - `HSET/HGET/HGETALL/HDEL` for the node registry
//! - `SCAN MATCH` for key listing
//! - Lua scripts for compare-and-renew / compare-and-delete, so a node can
//!   only extend or release a key it still holds

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::Commands;
use tracing::instrument;

use super::{CoordinationStore, StoreError, StoreResult};

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisCoordinationStore {
    client: Arc<redis::Client>,
}

impl RedisCoordinationStore {
    /// Create a store from a connection URL (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> StoreResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Longest expiry sent to Redis; the in-memory store caps at the same span.
const MAX_TTL_MILLIS: u64 = 36_500 * 24 * 60 * 60 * 1000;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).clamp(1, MAX_TTL_MILLIS)
}

fn command_error(op: &str, e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
        StoreError::Unavailable(format!("{op}: {e}"))
    } else {
        StoreError::Backend(format!("{op}: {e}"))
    }
}

impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self, value), err)]
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| command_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| command_error("SET", e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        conn.get(key).map_err(|e| command_error("GET", e))
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.del(key).map_err(|e| command_error("DEL", e))?;
        Ok(removed > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| command_error("PEXPIRE", e))?;
        Ok(updated == 1)
    }

    fn hash_put(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: i64 = conn
            .hset(hash, field, value)
            .map_err(|e| command_error("HSET", e))?;
        Ok(())
    }

    fn hash_get(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        conn.hget(hash, field).map_err(|e| command_error("HGET", e))
    }

    fn hash_entries(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection()?;
        conn.hgetall(hash).map_err(|e| command_error("HGETALL", e))
    }

    fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.hdel(hash, field).map_err(|e| command_error("HDEL", e))?;
        Ok(removed > 0)
    }

    fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection()?;
        let mut keys: Vec<String> = conn
            .scan_match::<_, String>(pattern)
            .map_err(|e| command_error("SCAN", e))?
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    #[instrument(skip(self, expected), err)]
    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let updated: i64 = redis::Script::new(EXPIRE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke(&mut conn)
            .map_err(|e| command_error("EXPIRE_IF_EQUALS", e))?;
        Ok(updated == 1)
    }

    #[instrument(skip(self, expected), err)]
    fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::Script::new(DELETE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(|e| command_error("DELETE_IF_EQUALS", e))?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_clamped_to_a_valid_expiry() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(ttl_millis(Duration::from_secs(u64::MAX)), MAX_TTL_MILLIS);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL_MILLIS);
    }
}
