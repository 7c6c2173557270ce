//! Dead-letter queue for failures that ran out of retries.
//!
//! Messages are held in this process's memory. The failure record they point
//! at stays in the [`FailureRepository`] and carries the message id and the
//! dead-letter reason, so [`DeadLetterQueue::restore`] can rebuild the queue
//! after a restart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use flowguard_coordination::{DistributedLock, LockOutcome};
use flowguard_core::{Clock, CoreError, DeadLetterId, FailureId, require_non_empty};

use crate::compensation::{CompensationExecutor, CompensationReport};
use crate::error::RecoveryResult;
use crate::failure::{DEAD_LETTER_NOTE, FailureRecord, FailureStatus, ResolutionMethod, Severity};
use crate::notify::Notifier;
use crate::repository::FailureRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterAction {
    /// Give the record a fresh retry budget, due now.
    Retry,
    Ignore,
    /// Run the compensations registered for the record's scope.
    Compensate,
}

impl fmt::Display for DeadLetterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterAction::Retry => "retry",
            DeadLetterAction::Ignore => "ignore",
            DeadLetterAction::Compensate => "compensate",
        };
        f.write_str(s)
    }
}

impl FromStr for DeadLetterAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(DeadLetterAction::Retry),
            "ignore" => Ok(DeadLetterAction::Ignore),
            "compensate" => Ok(DeadLetterAction::Compensate),
            other => Err(CoreError::validation(format!("unsupported dead-letter action: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: DeadLetterId,
    pub source_failure_id: FailureId,
    pub resource_ref: String,
    pub scope_ref: String,
    pub reason: String,
    pub total_retry_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
    pub processed_note: Option<String>,
    pub resolution: Option<DeadLetterAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved {
        message: DeadLetterMessage,
        compensation: Option<CompensationReport>,
    },
    AlreadyProcessed { message: DeadLetterMessage },
    NotFound,
    InvalidAction { action: String },
    /// Another node holds the compensation lock for the scope.
    ScopeBusy { scope_ref: String },
    /// The failure record behind the message no longer exists.
    SourceMissing { failure_id: FailureId },
    /// Another resolver is acting on the message right now.
    InProgress { message: DeadLetterMessage },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub unprocessed: usize,
    pub processed: usize,
    pub retried: usize,
    pub ignored: usize,
    pub compensated: usize,
}

pub struct DeadLetterQueue {
    repository: Arc<dyn FailureRepository>,
    notifier: Arc<dyn Notifier>,
    compensation: Arc<CompensationExecutor>,
    lock: DistributedLock,
    lock_ttl: Duration,
    clock: Arc<dyn Clock>,
    messages: RwLock<HashMap<DeadLetterId, DeadLetterMessage>>,
    claims: Mutex<HashSet<DeadLetterId>>,
}

struct Claim<'a> {
    claims: &'a Mutex<HashSet<DeadLetterId>>,
    message_id: DeadLetterId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().unwrap().remove(&self.message_id);
    }
}

impl DeadLetterQueue {
    pub fn new(
        repository: Arc<dyn FailureRepository>,
        notifier: Arc<dyn Notifier>,
        compensation: Arc<CompensationExecutor>,
        lock: DistributedLock,
        lock_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            notifier,
            compensation,
            lock,
            lock_ttl,
            clock,
            messages: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Move `record` to the queue.
    ///
    /// Idempotent per record: while an unprocessed message for the same
    /// failure exists it is returned unchanged and no second alert is sent.
    /// The record is parked as `Pending` with no `next_retry_at` and the
    /// message id, written in a single update. On a failed write `record`
    /// is left untouched and no message is queued.
    #[instrument(skip(self, record), fields(failure_id = %record.id))]
    pub fn enqueue(&self, record: &mut FailureRecord, reason: &str) -> RecoveryResult<DeadLetterMessage> {
        let now = self.clock.now();

        let message = {
            let mut messages = self.messages.write().unwrap();
            if let Some(existing) = messages
                .values()
                .find(|m| m.source_failure_id == record.id && !m.processed)
            {
                return Ok(existing.clone());
            }

            let mut parked = record.clone();
            parked.mark_dead_lettered(record.dead_letter_id.unwrap_or_else(DeadLetterId::new), reason, now);
            self.repository.update(&parked)?;
            *record = parked;

            let message = Self::message_for(record, reason, now);
            messages.insert(message.id, message.clone());
            message
        };

        warn!(
            message_id = %message.id,
            resource_ref = %message.resource_ref,
            attempts = message.total_retry_attempts,
            reason,
            "failure moved to dead-letter queue"
        );

        let context = json!({
            "message_id": message.id.to_string(),
            "failure_id": record.id.to_string(),
            "resource_ref": record.resource_ref,
            "classification": record.classification,
            "attempts": record.retry_count,
            "reason": reason,
        });
        let alert = format!("failure {} moved to dead-letter queue after {} attempts", record.id, record.retry_count);
        if let Err(e) = self.notifier.notify(Severity::High, &alert, &context) {
            warn!(message_id = %message.id, error = %e, "dead-letter alert not delivered");
        }

        Ok(message)
    }

    /// Rebuild messages for records parked in the repository by an earlier
    /// process, and queue exhausted records that were never parked. Returns
    /// how many messages were added.
    #[instrument(skip(self), err)]
    pub fn restore(&self) -> RecoveryResult<usize> {
        let pending = self.repository.list(Some(FailureStatus::Pending), usize::MAX)?;
        let mut restored = 0;
        let mut stranded = Vec::new();
        {
            let mut messages = self.messages.write().unwrap();
            for record in pending {
                if record.is_stranded() {
                    stranded.push(record);
                    continue;
                }
                if record.next_retry_at.is_some() {
                    continue;
                }
                let (Some(id), Some(at)) = (record.dead_letter_id, record.dead_lettered_at) else {
                    continue;
                };
                if messages.contains_key(&id) {
                    continue;
                }
                let reason = record
                    .resolution_note
                    .as_deref()
                    .and_then(|n| n.strip_prefix(DEAD_LETTER_NOTE))
                    .unwrap_or("retry budget exhausted");
                messages.insert(id, Self::message_for(&record, reason, at));
                restored += 1;
            }
        }

        for mut record in stranded {
            let lock_key = format!("retry:{}", record.id);
            let reason = format!("retry budget of {} exhausted", record.max_retry_count);
            match self
                .lock
                .with_lock(&lock_key, self.lock_ttl, || self.enqueue(&mut record, &reason))?
            {
                LockOutcome::Acquired(message) => {
                    message?;
                    restored += 1;
                }
                LockOutcome::Busy => debug!(failure_id = %record.id, "retry lock busy; left for its holder"),
            }
        }

        if restored > 0 {
            info!(restored, "dead-letter messages restored from repository");
        }
        Ok(restored)
    }

    fn message_for(record: &FailureRecord, reason: &str, at: DateTime<Utc>) -> DeadLetterMessage {
        DeadLetterMessage {
            id: record.dead_letter_id.unwrap_or_else(DeadLetterId::new),
            source_failure_id: record.id,
            resource_ref: record.resource_ref.clone(),
            scope_ref: record.scope().to_string(),
            reason: reason.to_string(),
            total_retry_attempts: record.retry_count,
            created_at: at,
            processed: false,
            processed_at: None,
            processed_by: None,
            processed_note: None,
            resolution: None,
        }
    }

    /// Apply an operator decision given as a string (`retry`, `ignore`,
    /// `compensate`).
    pub fn resolve_str(
        &self,
        message_id: DeadLetterId,
        action: &str,
        operator: &str,
        note: Option<String>,
    ) -> RecoveryResult<ResolveOutcome> {
        match action.parse::<DeadLetterAction>() {
            Ok(action) => self.resolve(message_id, action, operator, note),
            Err(_) => Ok(ResolveOutcome::InvalidAction {
                action: action.to_string(),
            }),
        }
    }

    #[instrument(skip_all, fields(message_id = %message_id, action = %action, operator = operator))]
    pub fn resolve(
        &self,
        message_id: DeadLetterId,
        action: DeadLetterAction,
        operator: &str,
        note: Option<String>,
    ) -> RecoveryResult<ResolveOutcome> {
        require_non_empty("operator", operator)?;

        let (message, _claim) = match self.claim(message_id) {
            Ok(claimed) => claimed,
            Err(outcome) => return Ok(outcome),
        };

        let record = self.repository.find_by_id(message.source_failure_id)?;
        let now = self.clock.now();
        let mut compensation = None;

        match action {
            DeadLetterAction::Retry => {
                let Some(mut record) = record else {
                    return Ok(ResolveOutcome::SourceMissing {
                        failure_id: message.source_failure_id,
                    });
                };
                record.reset_for_retry(Some(format!("retry requested by {operator}")), now);
                self.repository.update(&record)?;
            }
            DeadLetterAction::Ignore => {
                if let Some(mut record) = record {
                    record.mark_ignored(operator, note.clone(), now);
                    self.repository.update(&record)?;
                }
            }
            DeadLetterAction::Compensate => {
                let scope = message.scope_ref.as_str();
                let lock_key = format!("compensation:{scope}");
                let outcome = self
                    .lock
                    .with_lock(&lock_key, self.lock_ttl, || self.compensation.execute_all(scope))?;

                let report = match outcome {
                    LockOutcome::Acquired(report) => report?,
                    LockOutcome::Busy => {
                        return Ok(ResolveOutcome::ScopeBusy {
                            scope_ref: scope.to_string(),
                        });
                    }
                };

                if !report.all_succeeded() {
                    let context = json!({
                        "message_id": message.id.to_string(),
                        "scope_ref": scope,
                        "failed": report.failed(),
                        "total": report.results.len(),
                    });
                    let alert = format!("{} compensation(s) failed for scope {scope}", report.failed());
                    if let Err(e) = self.notifier.notify(Severity::High, &alert, &context) {
                        warn!(message_id = %message.id, error = %e, "compensation alert not delivered");
                    }
                }

                if let Some(mut record) = record {
                    let summary = format!(
                        "compensated {} of {} transaction(s)",
                        report.results.len() - report.failed(),
                        report.results.len()
                    );
                    let note = Some(note.clone().map_or(summary.clone(), |n| format!("{summary}: {n}")));
                    record.mark_resolved(operator, ResolutionMethod::Compensated, note, now);
                    self.repository.update(&record)?;
                }
                compensation = Some(report);
            }
        }

        let mut messages = self.messages.write().unwrap();
        let Some(stored) = messages.get_mut(&message_id) else {
            return Ok(ResolveOutcome::NotFound);
        };
        stored.processed = true;
        stored.processed_at = Some(now);
        stored.processed_by = Some(operator.to_string());
        stored.processed_note = note;
        stored.resolution = Some(action);

        info!(operator, failure_id = %stored.source_failure_id, "dead-letter message resolved");
        Ok(ResolveOutcome::Resolved {
            message: stored.clone(),
            compensation,
        })
    }

    /// Reserve an unprocessed message for one resolver. The claim is
    /// released when the returned guard drops.
    fn claim(&self, message_id: DeadLetterId) -> Result<(DeadLetterMessage, Claim<'_>), ResolveOutcome> {
        let messages = self.messages.read().unwrap();
        let Some(message) = messages.get(&message_id) else {
            return Err(ResolveOutcome::NotFound);
        };
        if message.processed {
            return Err(ResolveOutcome::AlreadyProcessed {
                message: message.clone(),
            });
        }
        if !self.claims.lock().unwrap().insert(message_id) {
            return Err(ResolveOutcome::InProgress {
                message: message.clone(),
            });
        }
        Ok((
            message.clone(),
            Claim {
                claims: &self.claims,
                message_id,
            },
        ))
    }

    pub fn get(&self, message_id: DeadLetterId) -> Option<DeadLetterMessage> {
        self.messages.read().unwrap().get(&message_id).cloned()
    }

    /// Newest first.
    pub fn list(&self, include_processed: bool) -> Vec<DeadLetterMessage> {
        let messages = self.messages.read().unwrap();
        let mut list: Vec<_> = messages
            .values()
            .filter(|m| include_processed || !m.processed)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        list
    }

    pub fn stats(&self) -> DeadLetterStats {
        let messages = self.messages.read().unwrap();
        let mut stats = DeadLetterStats {
            total: messages.len(),
            ..DeadLetterStats::default()
        };
        for message in messages.values() {
            if !message.processed {
                stats.unprocessed += 1;
                continue;
            }
            stats.processed += 1;
            match message.resolution {
                Some(DeadLetterAction::Retry) => stats.retried += 1,
                Some(DeadLetterAction::Ignore) => stats.ignored += 1,
                Some(DeadLetterAction::Compensate) => stats.compensated += 1,
                None => {}
            }
        }
        stats
    }

    /// Drop processed messages handled before `cutoff`.
    pub fn purge_processed(&self, cutoff: DateTime<Utc>) -> usize {
        let mut messages = self.messages.write().unwrap();
        let before = messages.len();
        messages.retain(|_, m| !(m.processed && m.processed_at.is_some_and(|at| at < cutoff)));
        let purged = before - messages.len();
        if purged > 0 {
            info!(purged, "purged processed dead-letter messages");
        }
        purged
    }
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use flowguard_coordination::{CoordinationStore, InMemoryCoordinationStore, KeySpace, LocalNode, SharedStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    use flowguard_core::ManualClock;
    use serde_json::{Map, Value as JsonValue};

    use super::*;
    use crate::compensation::{CompensationAction, CompensationHandler};
    use crate::failure::NewFailure;
    use crate::notify::RecordingNotifier;
    use crate::repository::InMemoryFailureRepository;
    use crate::repository::testing::FlakyRepository;

    struct OkHandler;

    impl CompensationHandler for OkHandler {
        fn rollback_variables(&self, _: &str, _: &str, _: &Map<String, JsonValue>) -> Result<(), String> {
            Ok(())
        }

        fn cancel_task(&self, _: &str, _: &str, task_id: &str) -> Result<(), String> {
            if task_id == "stuck" {
                return Err("task is locked".into());
            }
            Ok(())
        }

        fn terminate_scope(&self, _: &str, _: &str, _: &str) -> Result<(), String> {
            Ok(())
        }
    }

    /// Blocks inside `cancel_task` until the test lets it go.
    struct GatedHandler {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        calls: AtomicUsize,
    }

    impl CompensationHandler for GatedHandler {
        fn rollback_variables(&self, _: &str, _: &str, _: &Map<String, JsonValue>) -> Result<(), String> {
            Ok(())
        }

        fn cancel_task(&self, _: &str, _: &str, _: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(())
        }

        fn terminate_scope(&self, _: &str, _: &str, _: &str) -> Result<(), String> {
            Ok(())
        }
    }

    struct Fixture {
        dlq: Arc<DeadLetterQueue>,
        repository: Arc<dyn FailureRepository>,
        notifier: Arc<RecordingNotifier>,
        compensation: Arc<CompensationExecutor>,
        store: SharedStore,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(OkHandler), InMemoryFailureRepository::arc())
    }

    fn fixture_with(handler: Arc<dyn CompensationHandler>, repository: Arc<dyn FailureRepository>) -> Fixture {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        let local = Arc::new(LocalNode::new("node-a".parse().unwrap(), "127.0.0.1", 1, clock.now()));
        let lock = DistributedLock::new(store.clone(), KeySpace::new("test"), local);
        let notifier = Arc::new(RecordingNotifier::new());
        let compensation = Arc::new(CompensationExecutor::new(handler, clock.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(
            repository.clone(),
            notifier.clone(),
            compensation.clone(),
            lock,
            Duration::from_secs(60),
            clock.clone(),
        ));
        Fixture {
            dlq,
            repository,
            notifier,
            compensation,
            store,
            clock,
        }
    }

    fn exhausted_record(f: &Fixture) -> FailureRecord {
        let mut record = FailureRecord::new(
            NewFailure::new("task-7", "connection refused").with_scope("proc-1"),
            3,
            f.clock.now(),
        );
        record.retry_count = 3;
        f.repository.create(record.clone()).unwrap();
        record
    }

    #[test]
    fn enqueue_is_idempotent_and_alerts_once() {
        let f = fixture();
        let mut record = exhausted_record(&f);

        let first = f.dlq.enqueue(&mut record, "retries exhausted").unwrap();
        let second = f.dlq.enqueue(&mut record, "retries exhausted").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.total_retry_attempts, 3);
        assert_eq!(first.scope_ref, "proc-1");
        assert_eq!(f.dlq.list(false).len(), 1);

        let alerts = f.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, Severity::High);

        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, FailureStatus::Pending);
        assert_eq!(stored.next_retry_at, None);
        assert!(stored.resolution_note.unwrap().contains("retries exhausted"));
    }

    #[test]
    fn failed_alert_does_not_block_enqueue() {
        let f = fixture();
        f.notifier.set_failing(true);
        let mut record = exhausted_record(&f);
        assert!(f.dlq.enqueue(&mut record, "retries exhausted").is_ok());
        assert_eq!(f.dlq.stats().unprocessed, 1);
    }

    #[test]
    fn retry_resets_budget_and_is_due_now() {
        let f = fixture();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        let outcome = f.dlq.resolve(message.id, DeadLetterAction::Retry, "alice", None).unwrap();
        assert!(matches!(outcome, ResolveOutcome::Resolved { compensation: None, .. }));

        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.next_retry_at, Some(f.clock.now()));
        assert!(stored.is_due(f.clock.now()));
    }

    #[test]
    fn second_resolution_reports_already_processed() {
        let f = fixture();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        f.dlq
            .resolve(message.id, DeadLetterAction::Ignore, "alice", Some("known outage".into()))
            .unwrap();
        let again = f.dlq.resolve(message.id, DeadLetterAction::Retry, "bob", None).unwrap();

        match again {
            ResolveOutcome::AlreadyProcessed { message } => {
                assert_eq!(message.processed_by.as_deref(), Some("alice"));
                assert_eq!(message.resolution, Some(DeadLetterAction::Ignore));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, FailureStatus::Ignored);
        assert_eq!(stored.resolution_note.as_deref(), Some("known outage"));
    }

    #[test]
    fn compensate_runs_scope_and_resolves_record() {
        let f = fixture();
        f.compensation
            .register("proc-1", "reserve", CompensationAction::CancelTask { task_id: "t1".into() })
            .unwrap();
        f.compensation
            .register("proc-1", "charge", CompensationAction::CancelTask { task_id: "stuck".into() })
            .unwrap();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        let outcome = f
            .dlq
            .resolve_str(message.id, "COMPENSATE", "alice", None)
            .unwrap();
        let ResolveOutcome::Resolved { compensation: Some(report), .. } = outcome else {
            panic!("expected a compensation report");
        };
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failed(), 1);

        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, FailureStatus::Resolved);
        assert_eq!(stored.resolution_method, Some(ResolutionMethod::Compensated));
        assert_eq!(stored.resolution_note.as_deref(), Some("compensated 1 of 2 transaction(s)"));

        // enqueue alert + failed compensation alert
        assert_eq!(f.notifier.alerts().len(), 2);
        assert!(f.store.get("test:lock:compensation:proc-1").unwrap().is_none());
        assert_eq!(f.dlq.stats().compensated, 1);
    }

    #[test]
    fn compensate_waits_for_scope_lock() {
        let f = fixture();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();
        f.store
            .set("test:lock:compensation:proc-1", "node-b", Duration::from_secs(60))
            .unwrap();

        let outcome = f.dlq.resolve(message.id, DeadLetterAction::Compensate, "alice", None).unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::ScopeBusy {
                scope_ref: "proc-1".into()
            }
        );
        assert!(!f.dlq.get(message.id).unwrap().processed);
    }

    #[test]
    fn unknown_action_and_message_are_structured_outcomes() {
        let f = fixture();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        assert_eq!(
            f.dlq.resolve_str(message.id, "escalate", "alice", None).unwrap(),
            ResolveOutcome::InvalidAction {
                action: "escalate".into()
            }
        );
        assert_eq!(
            f.dlq.resolve(DeadLetterId::new(), DeadLetterAction::Ignore, "alice", None).unwrap(),
            ResolveOutcome::NotFound
        );
        assert!(f.dlq.resolve(message.id, DeadLetterAction::Ignore, "", None).is_err());
    }

    #[test]
    fn list_is_newest_first_and_purge_drops_old_processed() {
        let f = fixture();
        let mut older = exhausted_record(&f);
        let first = f.dlq.enqueue(&mut older, "exhausted").unwrap();
        f.clock.advance(chrono::Duration::minutes(1));
        let mut newer = exhausted_record(&f);
        let second = f.dlq.enqueue(&mut newer, "exhausted").unwrap();

        let ids: Vec<_> = f.dlq.list(false).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        f.dlq.resolve(first.id, DeadLetterAction::Ignore, "alice", None).unwrap();
        assert_eq!(f.dlq.list(false).len(), 1);
        assert_eq!(f.dlq.list(true).len(), 2);

        f.clock.advance(chrono::Duration::days(31));
        assert_eq!(f.dlq.purge_processed(f.clock.now() - chrono::Duration::days(30)), 1);
        assert_eq!(f.dlq.list(true).len(), 1);
    }

    #[test]
    fn failed_enqueue_write_queues_nothing() {
        let repository = Arc::new(FlakyRepository::default());
        let f = fixture_with(Arc::new(OkHandler), repository.clone());
        let mut record = exhausted_record(&f);
        let before = record.clone();

        repository.fail_next_update(|_| true);
        assert!(f.dlq.enqueue(&mut record, "exhausted").is_err());
        assert_eq!(record, before);
        assert!(f.dlq.list(true).is_empty());
        assert!(f.notifier.alerts().is_empty());

        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();
        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.dead_letter_id, Some(message.id));
        assert_eq!(stored.dead_lettered_at, Some(f.clock.now()));
    }

    #[test]
    fn claimed_message_is_not_resolved_twice() {
        let f = fixture();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        let claim = f.dlq.claim(message.id).unwrap();
        let outcome = f.dlq.resolve(message.id, DeadLetterAction::Ignore, "bob", None).unwrap();
        assert!(matches!(outcome, ResolveOutcome::InProgress { .. }));
        let stored = f.repository.find_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, FailureStatus::Pending);

        drop(claim);
        let outcome = f.dlq.resolve(message.id, DeadLetterAction::Ignore, "bob", None).unwrap();
        assert!(matches!(outcome, ResolveOutcome::Resolved { .. }));
    }

    #[test]
    fn concurrent_resolvers_run_side_effects_once() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let handler = Arc::new(GatedHandler {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            calls: AtomicUsize::new(0),
        });
        let f = fixture_with(handler.clone(), InMemoryFailureRepository::arc());
        f.compensation
            .register("proc-1", "reserve", CompensationAction::CancelTask { task_id: "t1".into() })
            .unwrap();
        let mut record = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut record, "exhausted").unwrap();

        let dlq = f.dlq.clone();
        let first = thread::spawn(move || dlq.resolve(message.id, DeadLetterAction::Compensate, "alice", None));
        entered_rx.recv().unwrap();

        let second = f.dlq.resolve(message.id, DeadLetterAction::Retry, "bob", None).unwrap();
        assert!(matches!(second, ResolveOutcome::InProgress { .. }));
        assert_eq!(f.repository.find_by_id(record.id).unwrap().unwrap().retry_count, 3);

        release_tx.send(()).unwrap();
        let first = first.join().unwrap().unwrap();
        assert!(matches!(first, ResolveOutcome::Resolved { .. }));

        let again = f.dlq.resolve(message.id, DeadLetterAction::Compensate, "bob", None).unwrap();
        assert!(matches!(again, ResolveOutcome::AlreadyProcessed { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.repository.find_by_id(record.id).unwrap().unwrap().resolution_method,
            Some(ResolutionMethod::Compensated)
        );
    }

    #[test]
    fn restore_rebuilds_queue_from_parked_records() {
        let f = fixture();
        let mut parked = exhausted_record(&f);
        let message = f.dlq.enqueue(&mut parked, "retries exhausted").unwrap();

        let stranded = exhausted_record(&f);

        let fresh = DeadLetterQueue::new(
            f.repository.clone(),
            f.notifier.clone(),
            f.compensation.clone(),
            DistributedLock::new(
                f.store.clone(),
                KeySpace::new("test"),
                Arc::new(LocalNode::new("node-b".parse().unwrap(), "127.0.0.1", 2, f.clock.now())),
            ),
            Duration::from_secs(60),
            f.clock.clone(),
        );
        assert_eq!(fresh.restore().unwrap(), 2);
        assert_eq!(fresh.restore().unwrap(), 0);

        let restored = fresh.get(message.id).unwrap();
        assert_eq!(restored.source_failure_id, parked.id);
        assert_eq!(restored.reason, "retries exhausted");
        assert_eq!(restored.created_at, message.created_at);

        let stored = f.repository.find_by_id(stranded.id).unwrap().unwrap();
        assert!(stored.is_dead_lettered());
        assert_eq!(fresh.list(false).len(), 2);
        assert!(matches!(
            fresh.resolve(message.id, DeadLetterAction::Ignore, "alice", None).unwrap(),
            ResolveOutcome::Resolved { .. }
        ));
    }
}
