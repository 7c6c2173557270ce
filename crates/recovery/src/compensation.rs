//! Compensating transactions.
//!
//! Activities register how to undo themselves as they complete. When a
//! process instance has to be unwound, `execute_all` runs every pending
//! compensation for that instance newest first. A failing compensation is
//! recorded and the chain continues with the next one.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, instrument, warn};

use flowguard_core::{Clock, CompensationId, CoreResult, require_non_empty};

/// How to undo one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompensationAction {
    /// Restore process variables to the given values.
    RollbackVariables { variables: Map<String, JsonValue> },
    CancelTask { task_id: String },
    TerminateScope { reason: String },
    /// Dispatched to a callback registered with
    /// [`CompensationExecutor::register_custom`].
    Custom { handler: String, data: JsonValue },
}

impl CompensationAction {
    pub fn kind(&self) -> CompensationKind {
        match self {
            CompensationAction::RollbackVariables { .. } => CompensationKind::RollbackVariables,
            CompensationAction::CancelTask { .. } => CompensationKind::CancelTask,
            CompensationAction::TerminateScope { .. } => CompensationKind::TerminateScope,
            CompensationAction::Custom { .. } => CompensationKind::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    RollbackVariables,
    CancelTask,
    TerminateScope,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationTransaction {
    pub id: CompensationId,
    /// Process instance the activity belongs to.
    pub scope_ref: String,
    pub activity_ref: String,
    pub action: CompensationAction,
    pub registered_at: DateTime<Utc>,
    /// Registration order inside this executor; breaks timestamp ties.
    pub sequence: u64,
    pub executed: bool,
    pub succeeded: bool,
    pub error_message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Bridge to the workflow engine for the built-in actions.
pub trait CompensationHandler: Send + Sync {
    fn rollback_variables(
        &self,
        scope_ref: &str,
        activity_ref: &str,
        variables: &Map<String, JsonValue>,
    ) -> Result<(), String>;

    fn cancel_task(&self, scope_ref: &str, activity_ref: &str, task_id: &str) -> Result<(), String>;

    fn terminate_scope(&self, scope_ref: &str, activity_ref: &str, reason: &str) -> Result<(), String>;
}

impl<T: CompensationHandler + ?Sized> CompensationHandler for Arc<T> {
    fn rollback_variables(
        &self,
        scope_ref: &str,
        activity_ref: &str,
        variables: &Map<String, JsonValue>,
    ) -> Result<(), String> {
        (**self).rollback_variables(scope_ref, activity_ref, variables)
    }

    fn cancel_task(&self, scope_ref: &str, activity_ref: &str, task_id: &str) -> Result<(), String> {
        (**self).cancel_task(scope_ref, activity_ref, task_id)
    }

    fn terminate_scope(&self, scope_ref: &str, activity_ref: &str, reason: &str) -> Result<(), String> {
        (**self).terminate_scope(scope_ref, activity_ref, reason)
    }
}

/// Callback for [`CompensationAction::Custom`].
pub type CustomCompensation = Arc<dyn Fn(&CompensationTransaction, &JsonValue) -> Result<(), String> + Send + Sync>;

/// Outcome of one transaction inside `execute_all`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationResult {
    pub transaction_id: CompensationId,
    pub activity_ref: String,
    pub kind: CompensationKind,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationReport {
    pub scope_ref: String,
    /// In execution order (newest registration first).
    pub results: Vec<CompensationResult>,
}

impl CompensationReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded)
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded).count()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

pub struct CompensationExecutor {
    handler: Arc<dyn CompensationHandler>,
    custom: RwLock<HashMap<String, CustomCompensation>>,
    transactions: RwLock<HashMap<String, Vec<CompensationTransaction>>>,
    sequence: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CompensationExecutor {
    pub fn new(handler: Arc<dyn CompensationHandler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handler,
            custom: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            clock,
        }
    }

    /// Register a callback for `Custom { handler: name, .. }` actions.
    pub fn register_custom<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&CompensationTransaction, &JsonValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.custom.write().unwrap().insert(name.into(), Arc::new(callback));
    }

    pub fn register(
        &self,
        scope_ref: &str,
        activity_ref: &str,
        action: CompensationAction,
    ) -> CoreResult<CompensationTransaction> {
        require_non_empty("scope_ref", scope_ref)?;
        require_non_empty("activity_ref", activity_ref)?;
        if let CompensationAction::Custom { handler, .. } = &action {
            require_non_empty("handler", handler)?;
        }

        let transaction = CompensationTransaction {
            id: CompensationId::new(),
            scope_ref: scope_ref.to_string(),
            activity_ref: activity_ref.to_string(),
            action,
            registered_at: self.clock.now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            executed: false,
            succeeded: false,
            error_message: None,
            executed_at: None,
        };

        self.transactions
            .write()
            .unwrap()
            .entry(scope_ref.to_string())
            .or_default()
            .push(transaction.clone());

        info!(
            scope = scope_ref,
            activity = activity_ref,
            kind = ?transaction.action.kind(),
            "registered compensation"
        );
        Ok(transaction)
    }

    /// Run every pending compensation of `scope_ref`, newest first.
    ///
    /// Transactions are claimed before they run, so a concurrent call for the
    /// same scope in this process does not execute them twice.
    #[instrument(skip(self), fields(scope = scope_ref))]
    pub fn execute_all(&self, scope_ref: &str) -> CoreResult<CompensationReport> {
        require_non_empty("scope_ref", scope_ref)?;

        let mut claimed: Vec<CompensationTransaction> = {
            let mut transactions = self.transactions.write().unwrap();
            transactions
                .get_mut(scope_ref)
                .map(|list| {
                    list.iter_mut()
                        .filter(|t| !t.executed)
                        .map(|t| {
                            t.executed = true;
                            t.clone()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        claimed.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then(b.sequence.cmp(&a.sequence))
        });

        let mut results = Vec::with_capacity(claimed.len());
        for transaction in &claimed {
            let outcome = self.run_one(transaction);
            let executed_at = self.clock.now();

            match &outcome {
                Ok(()) => info!(activity = %transaction.activity_ref, "compensation succeeded"),
                Err(e) => warn!(activity = %transaction.activity_ref, error = %e, "compensation failed"),
            }

            self.store_result(scope_ref, transaction.id, &outcome, executed_at);
            results.push(CompensationResult {
                transaction_id: transaction.id,
                activity_ref: transaction.activity_ref.clone(),
                kind: transaction.action.kind(),
                succeeded: outcome.is_ok(),
                error: outcome.err(),
            });
        }

        let report = CompensationReport {
            scope_ref: scope_ref.to_string(),
            results,
        };
        info!(total = report.results.len(), failed = report.failed(), "compensation finished");
        Ok(report)
    }

    /// Registered but not yet executed, in registration order.
    pub fn pending(&self, scope_ref: &str) -> Vec<CompensationTransaction> {
        self.history(scope_ref).into_iter().filter(|t| !t.executed).collect()
    }

    /// Every transaction of `scope_ref`, in registration order.
    pub fn history(&self, scope_ref: &str) -> Vec<CompensationTransaction> {
        let transactions = self.transactions.read().unwrap();
        let mut list = transactions.get(scope_ref).cloned().unwrap_or_default();
        list.sort_by_key(|t| t.sequence);
        list
    }

    fn run_one(&self, transaction: &CompensationTransaction) -> Result<(), String> {
        let scope = transaction.scope_ref.as_str();
        let activity = transaction.activity_ref.as_str();

        let run = || match &transaction.action {
            CompensationAction::RollbackVariables { variables } => {
                self.handler.rollback_variables(scope, activity, variables)
            }
            CompensationAction::CancelTask { task_id } => self.handler.cancel_task(scope, activity, task_id),
            CompensationAction::TerminateScope { reason } => self.handler.terminate_scope(scope, activity, reason),
            CompensationAction::Custom { handler, data } => {
                let callback = self.custom.read().unwrap().get(handler).cloned();
                match callback {
                    Some(callback) => callback(transaction, data),
                    None => Err(format!("no custom compensation handler registered as {handler:?}")),
                }
            }
        };

        panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("compensation handler panicked: {detail}"))
        })
    }

    fn store_result(
        &self,
        scope_ref: &str,
        id: CompensationId,
        outcome: &Result<(), String>,
        executed_at: DateTime<Utc>,
    ) {
        let mut transactions = self.transactions.write().unwrap();
        if let Some(t) = transactions
            .get_mut(scope_ref)
            .and_then(|list| list.iter_mut().find(|t| t.id == id))
        {
            t.succeeded = outcome.is_ok();
            t.error_message = outcome.as_ref().err().cloned();
            t.executed_at = Some(executed_at);
        }
    }
}

impl std::fmt::Debug for CompensationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationExecutor")
            .field("scopes", &self.transactions.read().map(|t| t.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use flowguard_core::{CoreError, ManualClock};
    use serde_json::json;

    use super::*;

    /// Records the order of calls; fails `cancel_task` for task ids in `failing`.
    #[derive(Default)]
    struct ScriptedHandler {
        calls: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl CompensationHandler for ScriptedHandler {
        fn rollback_variables(&self, _: &str, activity: &str, _: &Map<String, JsonValue>) -> Result<(), String> {
            self.calls.lock().unwrap().push(activity.to_string());
            Ok(())
        }

        fn cancel_task(&self, _: &str, activity: &str, task_id: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(activity.to_string());
            if self.failing.iter().any(|f| f == task_id) {
                return Err(format!("task {task_id} already completed"));
            }
            Ok(())
        }

        fn terminate_scope(&self, _: &str, activity: &str, _: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(activity.to_string());
            Ok(())
        }
    }

    fn executor(handler: Arc<ScriptedHandler>) -> (CompensationExecutor, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        (CompensationExecutor::new(handler, clock.clone()), clock)
    }

    fn cancel(task: &str) -> CompensationAction {
        CompensationAction::CancelTask { task_id: task.to_string() }
    }

    #[test]
    fn runs_newest_first_and_continues_past_failures() {
        let handler = Arc::new(ScriptedHandler {
            failing: vec!["task-2".to_string()],
            ..Default::default()
        });
        let (executor, clock) = executor(handler.clone());

        for i in 1..=3 {
            executor.register("proc-1", &format!("T{i}"), cancel(&format!("task-{i}"))).unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let report = executor.execute_all("proc-1").unwrap();

        assert_eq!(*handler.calls.lock().unwrap(), vec!["T3", "T2", "T1"]);
        let outcome: Vec<_> = report.results.iter().map(|r| (r.activity_ref.as_str(), r.succeeded)).collect();
        assert_eq!(outcome, vec![("T3", true), ("T2", false), ("T1", true)]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.results[1].error.as_deref(), Some("task task-2 already completed"));

        let history = executor.history("proc-1");
        assert!(history.iter().all(|t| t.executed && t.executed_at.is_some()));
        assert!(!history[1].succeeded);
    }

    #[test]
    fn same_timestamp_falls_back_to_registration_order() {
        let handler = Arc::new(ScriptedHandler::default());
        let (executor, _clock) = executor(handler.clone());

        executor.register("proc-1", "first", cancel("a")).unwrap();
        executor.register("proc-1", "second", cancel("b")).unwrap();
        executor.execute_all("proc-1").unwrap();

        assert_eq!(*handler.calls.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn executed_transactions_are_not_run_again() {
        let handler = Arc::new(ScriptedHandler::default());
        let (executor, _clock) = executor(handler.clone());

        executor.register("proc-1", "T1", cancel("a")).unwrap();
        assert_eq!(executor.execute_all("proc-1").unwrap().results.len(), 1);
        assert!(executor.execute_all("proc-1").unwrap().is_empty());

        executor.register("proc-1", "T2", cancel("b")).unwrap();
        assert_eq!(executor.pending("proc-1").len(), 1);
        let report = executor.execute_all("proc-1").unwrap();
        assert_eq!(report.results[0].activity_ref, "T2");
    }

    #[test]
    fn scopes_are_isolated() {
        let handler = Arc::new(ScriptedHandler::default());
        let (executor, _clock) = executor(handler.clone());

        executor.register("proc-1", "A", cancel("a")).unwrap();
        executor.register("proc-2", "B", cancel("b")).unwrap();
        executor.execute_all("proc-1").unwrap();

        assert_eq!(*handler.calls.lock().unwrap(), vec!["A"]);
        assert_eq!(executor.pending("proc-2").len(), 1);
        assert!(executor.execute_all("unknown").unwrap().is_empty());
    }

    #[test]
    fn custom_actions_dispatch_by_name() {
        let handler = Arc::new(ScriptedHandler::default());
        let (executor, _clock) = executor(handler);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        executor.register_custom("refund", move |t, data| {
            sink.lock().unwrap().push((t.activity_ref.clone(), data.clone()));
            Ok(())
        });

        executor
            .register(
                "proc-1",
                "charge",
                CompensationAction::Custom {
                    handler: "refund".into(),
                    data: json!({"amount": 42}),
                },
            )
            .unwrap();
        executor
            .register(
                "proc-1",
                "ship",
                CompensationAction::Custom {
                    handler: "recall".into(),
                    data: JsonValue::Null,
                },
            )
            .unwrap();

        let report = executor.execute_all("proc-1").unwrap();
        assert!(!report.results[0].succeeded);
        assert!(report.results[1].succeeded);
        assert_eq!(*seen.lock().unwrap(), vec![("charge".to_string(), json!({"amount": 42}))]);
    }

    #[test]
    fn custom_callback_can_register_more_handlers() {
        let (executor, _clock) = executor(Arc::new(ScriptedHandler::default()));
        let executor = Arc::new(executor);
        let weak = Arc::downgrade(&executor);
        executor.register_custom("install", move |_, _| {
            let executor = weak.upgrade().ok_or("executor dropped")?;
            executor.register_custom("follow-up", |_, _| Ok(()));
            Ok(())
        });

        let custom = |name: &str| CompensationAction::Custom {
            handler: name.into(),
            data: JsonValue::Null,
        };
        executor.register("proc-1", "T1", custom("install")).unwrap();
        assert!(executor.execute_all("proc-1").unwrap().all_succeeded());

        executor.register("proc-1", "T2", custom("follow-up")).unwrap();
        let report = executor.execute_all("proc-1").unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(report.all_succeeded());
    }

    #[test]
    fn panicking_custom_handler_fails_only_its_transaction() {
        let handler = Arc::new(ScriptedHandler::default());
        let (executor, _clock) = executor(handler.clone());
        executor.register_custom("explode", |_, _| panic!("boom"));

        executor.register("proc-1", "T1", cancel("a")).unwrap();
        executor
            .register(
                "proc-1",
                "T2",
                CompensationAction::Custom {
                    handler: "explode".into(),
                    data: JsonValue::Null,
                },
            )
            .unwrap();

        let report = executor.execute_all("proc-1").unwrap();
        assert_eq!(report.results[0].error.as_deref(), Some("compensation handler panicked: boom"));
        assert!(report.results[1].succeeded);
        assert_eq!(*handler.calls.lock().unwrap(), vec!["T1"]);
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let (executor, _clock) = executor(Arc::new(ScriptedHandler::default()));
        assert!(matches!(executor.register("", "T1", cancel("a")), Err(CoreError::Validation(_))));
        assert!(matches!(executor.register("p", " ", cancel("a")), Err(CoreError::Validation(_))));
        assert!(matches!(executor.execute_all(""), Err(CoreError::Validation(_))));
    }

    #[test]
    fn actions_serialize_as_tagged_union() {
        let action = CompensationAction::TerminateScope { reason: "cancelled".into() };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"type": "terminate_scope", "reason": "cancelled"})
        );
    }
}
