//! Node configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `FLOWGUARD_NODE_HOST` | `127.0.0.1` |
//! | `FLOWGUARD_NODE_PORT` | `8080` |
//! | `FLOWGUARD_KEY_PREFIX` | `flowguard` |
//! | `FLOWGUARD_HEARTBEAT_INTERVAL_SECS` | `10` |
//! | `FLOWGUARD_LEADER_LEASE_SECS` | `30` |
//! | `FLOWGUARD_LOCK_TTL_SECS` | `300` |
//! | `FLOWGUARD_RETRY_BASE_DELAY_SECS` | `30` |
//! | `FLOWGUARD_RETRY_MAX_DELAY_SECS` | `3600` |
//! | `FLOWGUARD_RETRY_MAX_ATTEMPTS` | `3` |
//! | `FLOWGUARD_RETRY_SWEEP_INTERVAL_SECS` | `60` |
//! | `FLOWGUARD_RETRY_BATCH_SIZE` | `100` |
//! | `FLOWGUARD_DLQ_CLEANUP_INTERVAL_SECS` | `3600` |
//! | `FLOWGUARD_DLQ_RETENTION_DAYS` | `30` |
//! | `FLOWGUARD_MAX_CONNECTIONS` | `100` |
//! | `REDIS_URL` | unset: in-memory coordination store |
//! | `DATABASE_URL` | unset: in-memory failure repository |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use flowguard_coordination::{KeySpace, MembershipConfig};
use flowguard_recovery::{RetryPolicy, RetrySchedulerConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub node_host: String,
    pub node_port: u16,
    pub key_prefix: String,
    pub heartbeat_interval: Duration,
    pub leader_lease_ttl: Duration,
    pub lock_ttl: Duration,
    pub retry_policy: RetryPolicy,
    pub retry_sweep_interval: Duration,
    pub retry_batch_size: usize,
    pub dlq_cleanup_interval: Duration,
    pub dlq_retention: chrono::Duration,
    /// Denominator of the connection-based load score.
    pub max_connections: u32,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_host: "127.0.0.1".to_string(),
            node_port: 8080,
            key_prefix: "flowguard".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            leader_lease_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            retry_sweep_interval: Duration::from_secs(60),
            retry_batch_size: 100,
            dlq_cleanup_interval: Duration::from_secs(3600),
            dlq_retention: chrono::Duration::days(30),
            max_connections: 100,
            redis_url: None,
            database_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, var, default.as_secs()).map(Duration::from_secs)
        };

        let retry_policy = RetryPolicy::exponential(
            parse(&lookup, "FLOWGUARD_RETRY_MAX_ATTEMPTS", defaults.retry_policy.max_retry_count)?,
            secs("FLOWGUARD_RETRY_BASE_DELAY_SECS", defaults.retry_policy.base_delay)?,
            secs("FLOWGUARD_RETRY_MAX_DELAY_SECS", defaults.retry_policy.max_delay)?,
        );

        let config = Self {
            node_host: lookup("FLOWGUARD_NODE_HOST").unwrap_or(defaults.node_host),
            node_port: parse(&lookup, "FLOWGUARD_NODE_PORT", defaults.node_port)?,
            key_prefix: lookup("FLOWGUARD_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            heartbeat_interval: secs("FLOWGUARD_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            leader_lease_ttl: secs("FLOWGUARD_LEADER_LEASE_SECS", defaults.leader_lease_ttl)?,
            lock_ttl: secs("FLOWGUARD_LOCK_TTL_SECS", defaults.lock_ttl)?,
            retry_policy,
            retry_sweep_interval: secs("FLOWGUARD_RETRY_SWEEP_INTERVAL_SECS", defaults.retry_sweep_interval)?,
            retry_batch_size: parse(&lookup, "FLOWGUARD_RETRY_BATCH_SIZE", defaults.retry_batch_size)?,
            dlq_cleanup_interval: secs("FLOWGUARD_DLQ_CLEANUP_INTERVAL_SECS", defaults.dlq_cleanup_interval)?,
            dlq_retention: chrono::Duration::days(parse(&lookup, "FLOWGUARD_DLQ_RETENTION_DAYS", 30i64)?),
            max_connections: parse(&lookup, "FLOWGUARD_MAX_CONNECTIONS", defaults.max_connections)?,
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("FLOWGUARD_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("FLOWGUARD_LEADER_LEASE_SECS", self.leader_lease_ttl),
            ("FLOWGUARD_LOCK_TTL_SECS", self.lock_ttl),
            ("FLOWGUARD_RETRY_SWEEP_INTERVAL_SECS", self.retry_sweep_interval),
            ("FLOWGUARD_DLQ_CLEANUP_INTERVAL_SECS", self.dlq_cleanup_interval),
        ];
        for (var, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::Inconsistent("key prefix must not be empty".to_string()));
        }
        if self.leader_lease_ttl <= self.heartbeat_interval {
            return Err(ConfigError::Inconsistent(format!(
                "leader lease ({:?}) must outlive the heartbeat interval ({:?})",
                self.leader_lease_ttl, self.heartbeat_interval
            )));
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err(ConfigError::Inconsistent(
                "retry base delay exceeds the maximum delay".to_string(),
            ));
        }
        if self.retry_batch_size == 0 {
            return Err(ConfigError::Inconsistent("retry batch size must be at least 1".to_string()));
        }
        if self.dlq_retention < chrono::Duration::zero() {
            return Err(ConfigError::Inconsistent("retention must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }

    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: self.heartbeat_interval,
            leader_lease_ttl: self.leader_lease_ttl,
        }
    }

    pub fn retry_scheduler(&self) -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            policy: self.retry_policy.clone(),
            lock_ttl: self.lock_ttl,
            batch_size: self.retry_batch_size,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
