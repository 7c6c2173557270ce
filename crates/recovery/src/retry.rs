//! Retry scheduling for failed operations.
//!
//! Every attempt runs under the cluster lock `retry:<failure id>`, so only
//! one node works on a record at a time. A record whose budget runs out is
//! handed to the [`DeadLetterQueue`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use flowguard_coordination::{DistributedLock, LocalNode, LockOutcome};
use flowguard_core::{Clock, DeadLetterId, FailureId, require_non_empty};

use crate::dead_letter::DeadLetterQueue;
use crate::error::RecoveryResult;
use crate::failure::{FailureRecord, FailureStatus, NewFailure, ResolutionMethod, RetryAttempt};
use crate::policy::RetryPolicy;
use crate::repository::FailureRepository;

/// Result of one business retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Failure(String),
}

impl<E: fmt::Display> From<Result<(), E>> for AttemptResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => AttemptResult::Success,
            Err(e) => AttemptResult::Failure(e.to_string()),
        }
    }
}

/// Re-runs the failed business operation behind a record.
pub trait RetryAction: Send + Sync {
    fn retry(&self, record: &FailureRecord) -> AttemptResult;
}

impl<F> RetryAction for F
where
    F: Fn(&FailureRecord) -> AttemptResult + Send + Sync,
{
    fn retry(&self, record: &FailureRecord) -> AttemptResult {
        self(record)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    NotFound,
    /// Resolved or ignored already; nothing was done.
    AlreadyResolved,
    /// Another node holds the record's lock.
    LockBusy,
    /// A sweep found the record no longer due once it held the lock.
    NotDue,
    /// The budget was already spent; the record went (or already was) in
    /// the dead-letter queue without a new attempt.
    MovedToDeadLetter { message_id: DeadLetterId },
    Resolved { attempts: u32 },
    Rescheduled {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    /// The attempt that used up the budget failed.
    Promoted {
        message_id: DeadLetterId,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub policy: RetryPolicy,
    /// TTL of the per-record lock; bounds how long a crashed node blocks a record.
    pub lock_ttl: Duration,
    /// Maximum records handled per sweep.
    pub batch_size: usize,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub sweeps: u64,
    pub attempted: u64,
    pub resolved: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
    pub lock_busy: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepEntry {
    pub failure_id: FailureId,
    pub outcome: Option<RetryOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    /// The node was draining and did not look for due records.
    pub skipped: bool,
    pub entries: Vec<SweepEntry>,
    /// Set when the due records could not be loaded at all.
    pub error: Option<String>,
}

impl SweepReport {
    fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            skipped: false,
            entries: Vec::new(),
            error: None,
        }
    }

    fn count(&self, pred: impl Fn(&RetryOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome.as_ref().is_some_and(&pred))
            .count()
    }

    pub fn resolved(&self) -> usize {
        self.count(|o| matches!(o, RetryOutcome::Resolved { .. }))
    }

    pub fn rescheduled(&self) -> usize {
        self.count(|o| matches!(o, RetryOutcome::Rescheduled { .. }))
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|o| matches!(o, RetryOutcome::Promoted { .. } | RetryOutcome::MovedToDeadLetter { .. }))
    }

    pub fn lock_busy(&self) -> usize {
        self.count(|o| matches!(o, RetryOutcome::LockBusy))
    }

    pub fn errors(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }
}

pub struct RetryScheduler {
    repository: Arc<dyn FailureRepository>,
    dead_letters: Arc<DeadLetterQueue>,
    lock: DistributedLock,
    node: Arc<LocalNode>,
    action: Arc<dyn RetryAction>,
    config: RetrySchedulerConfig,
    clock: Arc<dyn Clock>,
    stats: Mutex<RetryStats>,
}

impl RetryScheduler {
    pub fn new(
        repository: Arc<dyn FailureRepository>,
        dead_letters: Arc<DeadLetterQueue>,
        lock: DistributedLock,
        node: Arc<LocalNode>,
        action: Arc<dyn RetryAction>,
        config: RetrySchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            dead_letters,
            lock,
            node,
            action,
            config,
            clock,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.config.policy
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn failure(&self, id: FailureId) -> RecoveryResult<Option<FailureRecord>> {
        Ok(self.repository.find_by_id(id)?)
    }

    /// Persist a new failure and schedule its first retry one base delay out.
    #[instrument(skip(self, failure), fields(resource_ref = %failure.resource_ref))]
    pub fn record_failure(&self, failure: NewFailure) -> RecoveryResult<FailureRecord> {
        require_non_empty("resource_ref", &failure.resource_ref)?;

        let now = self.clock.now();
        let policy = &self.config.policy;
        let mut record = FailureRecord::new(failure, policy.max_retry_count, now);
        record.next_retry_at = Some(policy.next_retry_time(1, now));
        self.repository.create(record.clone())?;

        info!(
            failure_id = %record.id,
            classification = ?record.classification,
            severity = %record.severity,
            next_retry_at = ?record.next_retry_at,
            "failure recorded"
        );
        Ok(record)
    }

    /// Attempt one record now, under its cluster lock.
    #[instrument(skip(self), fields(node_id = %self.node.id()))]
    pub fn execute_retry(&self, id: FailureId) -> RecoveryResult<RetryOutcome> {
        self.retry_locked(id, None)
    }

    /// Runs [`Self::attempt`] under the record's lock. With `due_by` set the
    /// attempt only goes ahead if the record is still due at that instant.
    fn retry_locked(&self, id: FailureId, due_by: Option<DateTime<Utc>>) -> RecoveryResult<RetryOutcome> {
        match self.repository.find_by_id(id)? {
            None => return Ok(RetryOutcome::NotFound),
            Some(record) if record.is_terminal() => return Ok(RetryOutcome::AlreadyResolved),
            Some(_) => {}
        }

        let lock_key = format!("retry:{id}");
        let outcome = match self.lock.with_lock(&lock_key, self.config.lock_ttl, || self.attempt(id, due_by))? {
            LockOutcome::Acquired(outcome) => outcome?,
            LockOutcome::Busy => {
                debug!(failure_id = %id, "retry lock busy");
                RetryOutcome::LockBusy
            }
        };

        self.count(&outcome);
        Ok(outcome)
    }

    /// Attempt every due record once.
    ///
    /// A failing record is logged and reported in its entry; the sweep moves
    /// on to the next one.
    #[instrument(skip(self), fields(node_id = %self.node.id()))]
    pub fn execute_pending_retries(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::empty(now);
        self.stats.lock().unwrap().sweeps += 1;

        if self.node.is_draining() {
            debug!("draining; retry sweep skipped");
            report.skipped = true;
            return report;
        }

        self.requeue_stalled(now);

        let due = match self.repository.find_due(now, self.config.batch_size) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to load due failures");
                self.stats.lock().unwrap().errors += 1;
                report.error = Some(e.to_string());
                return report;
            }
        };

        for record in due {
            let entry = match self.retry_locked(record.id, Some(now)) {
                Ok(outcome) => SweepEntry {
                    failure_id: record.id,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    warn!(failure_id = %record.id, node_id = %self.node.id(), error = %e, "retry failed");
                    self.stats.lock().unwrap().errors += 1;
                    SweepEntry {
                        failure_id: record.id,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.entries.push(entry);
        }

        if !report.entries.is_empty() {
            info!(
                due = report.entries.len(),
                resolved = report.resolved(),
                rescheduled = report.rescheduled(),
                dead_lettered = report.dead_lettered(),
                lock_busy = report.lock_busy(),
                errors = report.errors(),
                "retry sweep finished"
            );
        }
        report
    }

    /// Delete resolved and ignored records untouched for `retention`.
    pub fn cleanup_resolved(&self, retention: chrono::Duration) -> RecoveryResult<usize> {
        let cutoff = self.clock.now() - retention;
        let removed = self.repository.delete_older_than(cutoff)?;
        if removed > 0 {
            info!(removed, %cutoff, "removed old failure records");
        }
        Ok(removed)
    }

    fn attempt(&self, id: FailureId, due_by: Option<DateTime<Utc>>) -> RecoveryResult<RetryOutcome> {
        // Re-read under the lock; another node may have finished or
        // rescheduled it since the due list was loaded.
        let Some(mut record) = self.repository.find_by_id(id)? else {
            return Ok(RetryOutcome::NotFound);
        };
        if record.is_terminal() {
            return Ok(RetryOutcome::AlreadyResolved);
        }
        if due_by.is_some_and(|now| !record.is_due(now)) {
            debug!(failure_id = %id, next_retry_at = ?record.next_retry_at, "no longer due");
            return Ok(RetryOutcome::NotDue);
        }

        if record.is_exhausted() {
            if let Some(message_id) = record.dead_letter_id {
                return Ok(RetryOutcome::MovedToDeadLetter { message_id });
            }
            let reason = format!("retry budget of {} exhausted", record.max_retry_count);
            let message = self.dead_letters.enqueue(&mut record, &reason)?;
            return Ok(RetryOutcome::MovedToDeadLetter { message_id: message.id });
        }

        let started_at = self.clock.now();
        record.mark_processing(started_at);
        self.repository.update(&record)?;

        let result = self.invoke(&record);
        self.node.record_task_processed();

        let finished_at = self.clock.now();
        let attempt = record.retry_count;
        record.record_attempt(RetryAttempt {
            attempt,
            node_id: self.node.id().to_string(),
            started_at,
            finished_at,
            success: result == AttemptResult::Success,
            error: match &result {
                AttemptResult::Failure(e) => Some(e.clone()),
                AttemptResult::Success => None,
            },
        });

        match result {
            AttemptResult::Success => {
                record.mark_resolved(
                    self.node.id().as_str(),
                    ResolutionMethod::AutoRetry,
                    Some(format!("resolved on attempt {attempt}")),
                    finished_at,
                );
                self.repository.update(&record)?;
                info!(failure_id = %id, attempt, "retry succeeded");
                Ok(RetryOutcome::Resolved { attempts: attempt })
            }
            AttemptResult::Failure(error) if record.is_exhausted() => {
                // Parking the record is the only write. If it fails the
                // record stays `Processing` until the stalled-record requeue
                // hands it back for promotion.
                record.mark_attempt_failed(error.clone(), None, finished_at);
                let reason = format!("failed {attempt} of {} attempts: {error}", record.max_retry_count);
                let message = self.dead_letters.enqueue(&mut record, &reason)?;
                Ok(RetryOutcome::Promoted {
                    message_id: message.id,
                    attempts: attempt,
                    error,
                })
            }
            AttemptResult::Failure(error) => {
                let next_retry_at = self.config.policy.next_retry_time(attempt, finished_at);
                record.mark_attempt_failed(error.clone(), Some(next_retry_at), finished_at);
                self.repository.update(&record)?;
                warn!(failure_id = %id, attempt, %next_retry_at, error = %error, "retry failed; rescheduled");
                Ok(RetryOutcome::Rescheduled {
                    attempt,
                    next_retry_at,
                    error,
                })
            }
        }
    }

    fn invoke(&self, record: &FailureRecord) -> AttemptResult {
        panic::catch_unwind(AssertUnwindSafe(|| self.action.retry(record))).unwrap_or_else(|payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AttemptResult::Failure(format!("retry action panicked: {detail}"))
        })
    }

    /// Put records left in `Processing` by a node that died mid-attempt back
    /// in the queue once their lock would have expired.
    fn requeue_stalled(&self, now: DateTime<Utc>) {
        let stalled = match self
            .repository
            .list(Some(FailureStatus::Processing), self.config.batch_size)
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to list in-flight failures");
                return;
            }
        };

        let lock_ttl = chrono::Duration::from_std(self.config.lock_ttl).unwrap_or(chrono::Duration::MAX);
        let abandoned = |record: &FailureRecord| {
            record.status == FailureStatus::Processing
                && record
                    .last_retry_at
                    .and_then(|at| at.checked_add_signed(lock_ttl))
                    .is_some_and(|deadline| deadline <= now)
        };

        for record in stalled.into_iter().filter(|r| abandoned(r)) {
            let id = record.id;
            // Re-read under the lock; another node may have requeued or
            // promoted it since the listing.
            let requeued = self.lock.with_lock(&format!("retry:{id}"), self.config.lock_ttl, || -> RecoveryResult<bool> {
                let Some(mut current) = self.repository.find_by_id(id)? else {
                    return Ok(false);
                };
                if !abandoned(&current) {
                    return Ok(false);
                }
                current.mark_attempt_failed(current.error_message.clone(), Some(now), now);
                self.repository.update(&current)?;
                Ok(true)
            });

            match requeued {
                Ok(LockOutcome::Acquired(Ok(true))) => warn!(failure_id = %id, "requeued abandoned retry"),
                Ok(LockOutcome::Acquired(Ok(false)) | LockOutcome::Busy) => {}
                Ok(LockOutcome::Acquired(Err(e))) => {
                    warn!(failure_id = %id, error = %e, "failed to requeue abandoned retry");
                }
                Err(e) => warn!(failure_id = %id, error = %e, "failed to requeue abandoned retry"),
            }
        }
    }

    fn count(&self, outcome: &RetryOutcome) {
        let mut stats = self.stats.lock().unwrap();
        match outcome {
            RetryOutcome::Resolved { .. } => {
                stats.attempted += 1;
                stats.resolved += 1;
            }
            RetryOutcome::Rescheduled { .. } => {
                stats.attempted += 1;
                stats.rescheduled += 1;
            }
            RetryOutcome::Promoted { .. } => {
                stats.attempted += 1;
                stats.dead_lettered += 1;
            }
            RetryOutcome::MovedToDeadLetter { .. } => stats.dead_lettered += 1,
            RetryOutcome::LockBusy => stats.lock_busy += 1,
            RetryOutcome::NotFound | RetryOutcome::AlreadyResolved | RetryOutcome::NotDue => {}
        }
    }
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("node_id", self.node.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
