//! Failure records and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use flowguard_core::{DeadLetterId, FailureId};

/// Resolution note prefix for records parked in the dead-letter queue.
pub const DEAD_LETTER_NOTE: &str = "moved to dead-letter queue: ";

/// Alert and triage severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Kind of failure, derived from the error signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    Connectivity,
    Validation,
    Permission,
    Conflict,
    NotFound,
    ResourceExhausted,
    Unknown,
}

impl FailureClass {
    /// Classify an error message by the first matching signature.
    pub fn classify(error_message: &str) -> Self {
        const SIGNATURES: &[(FailureClass, &[&str])] = &[
            (FailureClass::Timeout, &["timeout", "timed out", "deadline exceeded"]),
            (
                FailureClass::Connectivity,
                &["connection refused", "connection reset", "unreachable", "broken pipe", "dns"],
            ),
            (
                FailureClass::ResourceExhausted,
                &["out of memory", "quota", "too many", "rate limit", "exhausted", "disk full"],
            ),
            (
                FailureClass::Permission,
                &["permission denied", "forbidden", "unauthorized", "access denied"],
            ),
            (FailureClass::Conflict, &["conflict", "concurrent modification", "version mismatch"]),
            (FailureClass::NotFound, &["not found", "no such", "does not exist"]),
            (FailureClass::Validation, &["invalid", "validation", "malformed", "must not"]),
        ];

        let message = error_message.to_ascii_lowercase();
        SIGNATURES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| message.contains(n)))
            .map(|(class, _)| *class)
            .unwrap_or(FailureClass::Unknown)
    }

    pub fn default_severity(self) -> Severity {
        match self {
            FailureClass::Validation | FailureClass::NotFound => Severity::Low,
            FailureClass::Timeout | FailureClass::Conflict | FailureClass::Unknown => Severity::Medium,
            FailureClass::Connectivity | FailureClass::Permission => Severity::High,
            FailureClass::ResourceExhausted => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    /// Waiting for its next retry (or for an operator, once dead-lettered).
    Pending,
    /// A node holds the record's lock and is attempting it.
    Processing,
    Resolved,
    Ignored,
}

impl FailureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FailureStatus::Resolved | FailureStatus::Ignored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureStatus::Pending => "pending",
            FailureStatus::Processing => "processing",
            FailureStatus::Resolved => "resolved",
            FailureStatus::Ignored => "ignored",
        }
    }
}

/// How a record reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    AutoRetry,
    Ignored,
    Compensated,
}

/// One retry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Input for [`crate::RetryScheduler::record_failure`].
#[derive(Debug, Clone)]
pub struct NewFailure {
    pub resource_ref: String,
    pub scope_ref: Option<String>,
    pub error_message: String,
    pub context: JsonValue,
    pub severity: Option<Severity>,
}

impl NewFailure {
    pub fn new(resource_ref: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            resource_ref: resource_ref.into(),
            scope_ref: None,
            error_message: error_message.into(),
            context: JsonValue::Null,
            severity: None,
        }
    }

    /// Process instance whose compensations undo this failure.
    pub fn with_scope(mut self, scope_ref: impl Into<String>) -> Self {
        self.scope_ref = Some(scope_ref.into());
        self
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    /// Override the severity derived from the classification.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// A failed business operation awaiting retry or operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: FailureId,
    /// Process or task the failed operation belongs to.
    pub resource_ref: String,
    /// Compensation scope; falls back to `resource_ref` when unset.
    pub scope_ref: Option<String>,
    pub classification: FailureClass,
    pub severity: Severity,
    pub status: FailureStatus,
    pub error_message: String,
    pub context: JsonValue,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_method: Option<ResolutionMethod>,
    pub resolution_note: Option<String>,
    #[serde(default)]
    pub history: Vec<RetryAttempt>,
    /// Dead-letter message awaiting an operator, if any.
    #[serde(default)]
    pub dead_letter_id: Option<DeadLetterId>,
    #[serde(default)]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    pub fn new(failure: NewFailure, max_retry_count: u32, now: DateTime<Utc>) -> Self {
        let classification = FailureClass::classify(&failure.error_message);
        Self {
            id: FailureId::new(),
            resource_ref: failure.resource_ref,
            scope_ref: failure.scope_ref,
            classification,
            severity: failure.severity.unwrap_or_else(|| classification.default_severity()),
            status: FailureStatus::Pending,
            error_message: failure.error_message,
            context: failure.context,
            retry_count: 0,
            max_retry_count,
            last_retry_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_by: None,
            resolution_method: None,
            resolution_note: None,
            history: Vec::new(),
            dead_letter_id: None,
            dead_lettered_at: None,
        }
    }

    pub fn scope(&self) -> &str {
        self.scope_ref.as_deref().unwrap_or(&self.resource_ref)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retry_count
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == FailureStatus::Pending && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_letter_id.is_some()
    }

    /// Exhausted and parked without a dead-letter message, e.g. after a
    /// promotion that never reached the store.
    pub fn is_stranded(&self) -> bool {
        self.status == FailureStatus::Pending
            && self.is_exhausted()
            && self.next_retry_at.is_none()
            && !self.is_dead_lettered()
    }

    /// Park the record behind a dead-letter message.
    pub fn mark_dead_lettered(&mut self, message_id: DeadLetterId, reason: &str, now: DateTime<Utc>) {
        self.status = FailureStatus::Pending;
        self.next_retry_at = None;
        self.dead_letter_id = Some(message_id);
        self.dead_lettered_at = Some(now);
        self.resolution_note = Some(format!("{DEAD_LETTER_NOTE}{reason}"));
        self.updated_at = now;
    }

    /// Start an attempt: bump the counter and move to `Processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = FailureStatus::Processing;
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_resolved(
        &mut self,
        by: impl Into<String>,
        method: ResolutionMethod,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = FailureStatus::Resolved;
        self.next_retry_at = None;
        self.resolved_at = Some(now);
        self.resolved_by = Some(by.into());
        self.resolution_method = Some(method);
        if note.is_some() {
            self.resolution_note = note;
        }
        self.updated_at = now;
    }

    /// Back to `Pending` after a failed attempt; `next_retry_at` of `None`
    /// leaves the record for an operator.
    pub fn mark_attempt_failed(&mut self, error: String, next_retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.status = FailureStatus::Pending;
        self.error_message = error;
        self.next_retry_at = next_retry_at;
        self.updated_at = now;
    }

    pub fn mark_ignored(&mut self, by: impl Into<String>, note: Option<String>, now: DateTime<Utc>) {
        self.status = FailureStatus::Ignored;
        self.next_retry_at = None;
        self.resolved_at = Some(now);
        self.resolved_by = Some(by.into());
        self.resolution_method = Some(ResolutionMethod::Ignored);
        if note.is_some() {
            self.resolution_note = note;
        }
        self.updated_at = now;
    }

    /// Fresh retry budget, due immediately.
    pub fn reset_for_retry(&mut self, note: Option<String>, now: DateTime<Utc>) {
        self.status = FailureStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = Some(now);
        self.dead_letter_id = None;
        self.dead_lettered_at = None;
        if note.is_some() {
            self.resolution_note = note;
        }
        self.updated_at = now;
    }

    pub fn record_attempt(&mut self, attempt: RetryAttempt) {
        self.history.push(attempt);
    }
}
