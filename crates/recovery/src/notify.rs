//! Operator alerting.

use std::sync::Mutex;

use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::failure::Severity;

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Alert sink. Callers log a failed notification and carry on.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str, context: &JsonValue) -> Result<(), NotifyError>;
}

impl<T: Notifier + ?Sized> Notifier for std::sync::Arc<T> {
    fn notify(&self, severity: Severity, message: &str, context: &JsonValue) -> Result<(), NotifyError> {
        (**self).notify(severity, message, context)
    }
}

/// Writes alerts to the log; the default when no external channel is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str, context: &JsonValue) -> Result<(), NotifyError> {
        match severity {
            Severity::Low | Severity::Medium => info!(alert = true, %severity, %context, "{message}"),
            Severity::High => warn!(alert = true, %severity, %context, "{message}"),
            Severity::Critical => error!(alert = true, %severity, %context, "{message}"),
        }
        Ok(())
    }
}

/// Keeps every alert in memory. Useful in tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(Severity, String, JsonValue)>>,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(Severity, String, JsonValue)> {
        self.alerts.lock().unwrap().clone()
    }

    /// Make subsequent `notify` calls fail (after recording).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, severity: Severity, message: &str, context: &JsonValue) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .unwrap()
            .push((severity, message.to_string(), context.clone()));

        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError("alert channel unavailable".to_string()));
        }
        Ok(())
    }
}
