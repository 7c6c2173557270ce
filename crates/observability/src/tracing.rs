//! Tracing/logging initialization.
//!
//! Output defaults to JSON lines so that node id, failure id and resource key
//! fields stay machine-readable. `FLOWGUARD_LOG_FORMAT=text` switches to the
//! human-readable formatter for local runs.

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Read `FLOWGUARD_LOG_FORMAT` (`json` | `text`).
    pub fn from_env() -> Self {
        let format = match std::env::var("FLOWGUARD_LOG_FORMAT").as_deref() {
            Ok("text") | Ok("pretty") => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let _ = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_a_no_op() {
        init(LogConfig::default());
        init(LogConfig {
            default_filter: "debug".to_string(),
            format: LogFormat::Text,
        });
    }
}
