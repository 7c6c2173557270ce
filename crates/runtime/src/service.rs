//! Request/response facade over a [`Coordinator`].
//!
//! Requests and responses are serde-tagged enums, so any transport that can
//! move JSON documents can serve them; the `flowguard-node` binary uses one
//! document per line on stdin/stdout. Expected failures (contention, unknown
//! ids, already processed messages, invalid actions) come back as responses,
//! never as panics.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use flowguard_coordination::{
    BalancerError, HeartbeatReport, HeldLock, LoadReport, LockOutcome, NodeDescriptor, StoreError,
};
use flowguard_core::{CoreError, DeadLetterId, FailureId, NodeId};
use flowguard_recovery::{
    CompensationAction, CompensationReport, CompensationTransaction, DeadLetterMessage, DeadLetterStats,
    FailureRecord, NewFailure, RecoveryError, RepositoryError, ResolveOutcome, RetryOutcome, RetryStats, Severity,
    SweepReport,
};

use crate::coordinator::Coordinator;

/// Upper bound for a lock TTL given in a request.
const MAX_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    RegisterNode,
    Heartbeat,
    TryAcquireLeadership,
    ReleaseLeadership,
    CurrentLeader,
    ListActiveNodes,
    IsNodeAlive {
        node_id: String,
    },
    AcquireLock {
        resource_key: String,
        /// Falls back to the configured lock TTL.
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    ReleaseLock {
        resource_key: String,
    },
    ListLocks,
    RecordFailure {
        resource_ref: String,
        error_message: String,
        #[serde(default)]
        scope_ref: Option<String>,
        #[serde(default)]
        context: Option<JsonValue>,
        #[serde(default)]
        severity: Option<Severity>,
    },
    ExecuteRetry {
        failure_id: String,
    },
    ExecutePendingRetries,
    RetryStats,
    MoveToDeadLetter {
        failure_id: String,
        reason: String,
    },
    ResolveDeadLetter {
        message_id: String,
        action: String,
        operator: String,
        #[serde(default)]
        note: Option<String>,
    },
    ListDeadLetters {
        #[serde(default)]
        include_processed: bool,
    },
    DeadLetterStats,
    RegisterCompensation {
        scope_ref: String,
        activity_ref: String,
        action: CompensationAction,
    },
    ExecuteCompensation {
        scope_ref: String,
    },
    SelectNode {
        work_class: String,
    },
    LoadReport,
    Drain,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Conflict,
    NoNodeAvailable,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Registered { registered: bool },
    Heartbeat { report: HeartbeatReport },
    Leadership { leader: bool },
    LeadershipReleased { released: bool },
    Leader { node_id: Option<NodeId> },
    Nodes { nodes: Vec<NodeDescriptor> },
    Alive { alive: bool },
    Lock { resource_key: String, acquired: bool },
    LockReleased { resource_key: String, released: bool },
    Locks { locks: Vec<HeldLock> },
    FailureRecorded { record: Box<FailureRecord> },
    Retry { outcome: RetryOutcome },
    Sweep { report: SweepReport },
    RetryStats { stats: RetryStats },
    DeadLettered { message: DeadLetterMessage },
    DeadLetterResolution { outcome: Box<ResolveOutcome> },
    DeadLetters { messages: Vec<DeadLetterMessage> },
    DeadLetterStats { stats: DeadLetterStats },
    CompensationRegistered { transaction: CompensationTransaction },
    Compensation { report: CompensationReport },
    NodeSelected { node: NodeDescriptor },
    LoadReport { report: LoadReport },
    Draining,
    Resumed { registered: bool },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<CoreError> for Response {
    fn from(e: CoreError) -> Self {
        Response::error(ErrorKind::InvalidRequest, e.to_string())
    }
}

impl From<RepositoryError> for Response {
    fn from(e: RepositoryError) -> Self {
        let kind = match e {
            RepositoryError::NotFound(_) => ErrorKind::NotFound,
            RepositoryError::AlreadyExists(_) => ErrorKind::Conflict,
            RepositoryError::Storage(_) => ErrorKind::Unavailable,
        };
        Response::error(kind, e.to_string())
    }
}

impl From<RecoveryError> for Response {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Validation(e) => e.into(),
            RecoveryError::Repository(e) => e.into(),
        }
    }
}

impl From<StoreError> for Response {
    fn from(e: StoreError) -> Self {
        Response::error(ErrorKind::Unavailable, e.to_string())
    }
}

impl From<BalancerError> for Response {
    fn from(e: BalancerError) -> Self {
        Response::error(ErrorKind::NoNodeAvailable, e.to_string())
    }
}

/// Serves [`Request`]s against one coordinator.
#[derive(Debug, Clone)]
pub struct Service {
    coordinator: Arc<Coordinator>,
}

impl Service {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Decode one JSON request, handle it and encode the response.
    pub fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(e) => Response::error(ErrorKind::InvalidRequest, format!("malformed request: {e}")),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode response");
            r#"{"type":"error","kind":"unavailable","message":"response encoding failed"}"#.to_string()
        })
    }

    pub fn handle(&self, request: Request) -> Response {
        let _connection = self.coordinator.track_connection();
        debug!(request = ?request, "handling request");
        self.dispatch(request).unwrap_or_else(|response| response)
    }

    fn dispatch(&self, request: Request) -> Result<Response, Response> {
        let c = &self.coordinator;
        let response = match request {
            Request::RegisterNode => Response::Registered {
                registered: c.membership().register_node(),
            },
            Request::Heartbeat => Response::Heartbeat {
                report: c.membership().heartbeat(),
            },
            Request::TryAcquireLeadership => Response::Leadership {
                leader: c.membership().try_acquire_leadership(),
            },
            Request::ReleaseLeadership => Response::LeadershipReleased {
                released: c.membership().release_leadership(),
            },
            Request::CurrentLeader => Response::Leader {
                node_id: c.membership().current_leader(),
            },
            Request::ListActiveNodes => Response::Nodes {
                nodes: c.membership().list_active_nodes(),
            },
            Request::IsNodeAlive { node_id } => {
                let node_id: NodeId = node_id.parse()?;
                Response::Alive {
                    alive: c.membership().is_node_alive(&node_id),
                }
            }
            Request::AcquireLock { resource_key, ttl_secs } => {
                let ttl = ttl_secs.map(Duration::from_secs).unwrap_or(c.config().lock_ttl);
                if ttl.is_zero() || ttl > MAX_LOCK_TTL {
                    return Err(Response::error(
                        ErrorKind::InvalidRequest,
                        format!("lock ttl must be between 1 and {} seconds", MAX_LOCK_TTL.as_secs()),
                    ));
                }
                let acquired = c.locks().acquire(&resource_key, ttl)?;
                Response::Lock { resource_key, acquired }
            }
            Request::ReleaseLock { resource_key } => {
                let released = c.locks().release(&resource_key)?;
                Response::LockReleased { resource_key, released }
            }
            Request::ListLocks => Response::Locks {
                locks: c.locks().held_locks()?,
            },
            Request::RecordFailure {
                resource_ref,
                error_message,
                scope_ref,
                context,
                severity,
            } => {
                let mut failure = NewFailure::new(resource_ref, error_message);
                if let Some(scope_ref) = scope_ref {
                    failure = failure.with_scope(scope_ref);
                }
                if let Some(context) = context {
                    failure = failure.with_context(context);
                }
                if let Some(severity) = severity {
                    failure = failure.with_severity(severity);
                }
                Response::FailureRecorded {
                    record: Box::new(c.retries().record_failure(failure)?),
                }
            }
            Request::ExecuteRetry { failure_id } => Response::Retry {
                outcome: c.retries().execute_retry(failure_id.parse()?)?,
            },
            Request::ExecutePendingRetries => Response::Sweep {
                report: c.retries().execute_pending_retries(c.clock().now()),
            },
            Request::RetryStats => Response::RetryStats {
                stats: c.retries().stats(),
            },
            Request::MoveToDeadLetter { failure_id, reason } => {
                let id: FailureId = failure_id.parse()?;
                // Same lock as a retry attempt, so the record cannot be
                // parked while an attempt is running.
                let moved = c.locks().with_lock(
                    &format!("retry:{id}"),
                    c.config().lock_ttl,
                    || -> Result<DeadLetterMessage, Response> {
                        let Some(mut record) = c.repository().find_by_id(id)? else {
                            return Err(Response::error(ErrorKind::NotFound, format!("failure {id} not found")));
                        };
                        if record.is_terminal() {
                            return Err(Response::error(
                                ErrorKind::Conflict,
                                format!("failure {id} is already {}", record.status.as_str()),
                            ));
                        }
                        // Parked by another node; its queue owns the message.
                        if let Some(message_id) = record
                            .dead_letter_id
                            .filter(|m| c.dead_letters().get(*m).is_none())
                        {
                            return Err(Response::error(
                                ErrorKind::Conflict,
                                format!("failure {id} is already dead-lettered as {message_id}"),
                            ));
                        }
                        Ok(c.dead_letters().enqueue(&mut record, &reason)?)
                    },
                )?;
                match moved {
                    LockOutcome::Acquired(message) => Response::DeadLettered { message: message? },
                    LockOutcome::Busy => {
                        return Err(Response::error(ErrorKind::Conflict, format!("failure {id} is being retried")));
                    }
                }
            }
            Request::ResolveDeadLetter {
                message_id,
                action,
                operator,
                note,
            } => {
                let id: DeadLetterId = message_id.parse()?;
                Response::DeadLetterResolution {
                    outcome: Box::new(c.dead_letters().resolve_str(id, &action, &operator, note)?),
                }
            }
            Request::ListDeadLetters { include_processed } => Response::DeadLetters {
                messages: c.dead_letters().list(include_processed),
            },
            Request::DeadLetterStats => Response::DeadLetterStats {
                stats: c.dead_letters().stats(),
            },
            Request::RegisterCompensation {
                scope_ref,
                activity_ref,
                action,
            } => Response::CompensationRegistered {
                transaction: c.compensation().register(&scope_ref, &activity_ref, action)?,
            },
            Request::ExecuteCompensation { scope_ref } => {
                let lock_key = format!("compensation:{scope_ref}");
                match c
                    .locks()
                    .with_lock(&lock_key, c.config().lock_ttl, || c.compensation().execute_all(&scope_ref))?
                {
                    LockOutcome::Acquired(report) => Response::Compensation { report: report? },
                    LockOutcome::Busy => {
                        return Err(Response::error(
                            ErrorKind::Conflict,
                            format!("compensation for scope {scope_ref} is already running"),
                        ));
                    }
                }
            }
            Request::SelectNode { work_class } => Response::NodeSelected {
                node: c.balancer().select_best_node(&work_class)?,
            },
            Request::LoadReport => Response::LoadReport {
                report: c.balancer().cluster_load_report(),
            },
            Request::Drain => {
                c.drain();
                Response::Draining
            }
            Request::Resume => Response::Resumed { registered: c.resume() },
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use flowguard_coordination::CoordinationStore;
    use serde_json::json;

    use crate::config::Config;

    use super::*;

    fn service() -> Service {
        let coordinator = Coordinator::builder(Config::default())
            .node_id("node-a".parse().unwrap())
            .build()
            .unwrap();
        Service::new(Arc::new(coordinator))
    }

    fn call(service: &Service, request: JsonValue) -> JsonValue {
        serde_json::from_str(&service.handle_json(&request.to_string())).unwrap()
    }

    #[test]
    fn register_and_list_nodes() {
        let service = service();
        assert_eq!(
            call(&service, json!({"type": "register_node"})),
            json!({"type": "registered", "registered": true})
        );

        let nodes = call(&service, json!({"type": "list_active_nodes"}));
        assert_eq!(nodes["type"], "nodes");
        assert_eq!(nodes["nodes"][0]["node_id"], "node-a");
    }

    #[test]
    fn leadership_round_trip() {
        let service = service();
        assert_eq!(
            service.handle(Request::TryAcquireLeadership),
            Response::Leadership { leader: true }
        );
        assert_eq!(
            service.handle(Request::CurrentLeader),
            Response::Leader {
                node_id: Some("node-a".parse().unwrap())
            }
        );
        assert_eq!(
            service.handle(Request::ReleaseLeadership),
            Response::LeadershipReleased { released: true }
        );
        assert_eq!(service.handle(Request::CurrentLeader), Response::Leader { node_id: None });
    }

    #[test]
    fn lock_requests_report_contention_as_data() {
        let service = service();
        let acquire = json!({"type": "acquire_lock", "resource_key": "order-7", "ttl_secs": 60});

        assert_eq!(call(&service, acquire.clone())["acquired"], true);
        assert_eq!(call(&service, acquire)["acquired"], false);
        assert_eq!(
            call(&service, json!({"type": "release_lock", "resource_key": "order-7"}))["released"],
            true
        );
    }

    #[test]
    fn empty_lock_key_is_an_invalid_request() {
        let response = service().handle(Request::AcquireLock {
            resource_key: " ".to_string(),
            ttl_secs: None,
        });
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));
    }

    #[test]
    fn malformed_json_is_an_invalid_request() {
        let service = service();
        let response = call(&service, json!({"type": "launch_rockets"}));
        assert_eq!(response["type"], "error");
        assert_eq!(response["kind"], "invalid_request");

        let response: JsonValue = serde_json::from_str(&service.handle_json("not json")).unwrap();
        assert_eq!(response["kind"], "invalid_request");
    }

    #[test]
    fn unknown_ids_are_reported_not_panicked() {
        let service = service();
        let missing = FailureId::new().to_string();

        assert_eq!(
            call(&service, json!({"type": "execute_retry", "failure_id": missing}))["outcome"]["outcome"],
            "not_found"
        );
        assert_eq!(
            call(&service, json!({"type": "move_to_dead_letter", "failure_id": missing, "reason": "x"}))["kind"],
            "not_found"
        );
        assert_eq!(
            call(&service, json!({"type": "execute_retry", "failure_id": "nope"}))["kind"],
            "invalid_request"
        );
    }

    #[test]
    fn manual_dead_letter_and_invalid_action() {
        let service = service();
        let recorded = call(
            &service,
            json!({"type": "record_failure", "resource_ref": "invoice-9", "error_message": "connection refused"}),
        );
        let failure_id = recorded["record"]["id"].as_str().unwrap().to_string();
        assert_eq!(recorded["record"]["classification"], "connectivity");

        let moved = call(
            &service,
            json!({"type": "move_to_dead_letter", "failure_id": failure_id, "reason": "operator escalation"}),
        );
        assert_eq!(moved["type"], "dead_lettered");
        let message_id = moved["message"]["id"].as_str().unwrap().to_string();

        let invalid = call(
            &service,
            json!({"type": "resolve_dead_letter", "message_id": message_id, "action": "explode", "operator": "ops"}),
        );
        assert_eq!(invalid["outcome"]["outcome"], "invalid_action");

        let ignored = call(
            &service,
            json!({"type": "resolve_dead_letter", "message_id": message_id, "action": "IGNORE", "operator": "ops"}),
        );
        assert_eq!(ignored["outcome"]["outcome"], "resolved");

        let again = call(
            &service,
            json!({"type": "resolve_dead_letter", "message_id": message_id, "action": "retry", "operator": "ops"}),
        );
        assert_eq!(again["outcome"]["outcome"], "already_processed");

        let stats = call(&service, json!({"type": "dead_letter_stats"}));
        assert_eq!(stats["stats"]["ignored"], 1);
    }

    #[test]
    fn oversized_lock_ttl_is_an_invalid_request() {
        let service = service();
        for ttl in [0, u64::MAX] {
            let response = call(
                &service,
                json!({"type": "acquire_lock", "resource_key": "order-7", "ttl_secs": ttl}),
            );
            assert_eq!(response["kind"], "invalid_request");
        }
        let response = call(
            &service,
            json!({"type": "acquire_lock", "resource_key": "order-7", "ttl_secs": 86_400}),
        );
        assert_eq!(response["acquired"], true);
    }

    #[test]
    fn list_locks_reports_holders() {
        let service = service();
        call(&service, json!({"type": "acquire_lock", "resource_key": "order-7"}));
        service
            .coordinator()
            .store()
            .set("flowguard:lock:order-9", "node-b", Duration::from_secs(60))
            .unwrap();

        let locks = call(&service, json!({"type": "list_locks"}));
        assert_eq!(
            locks,
            json!({"type": "locks", "locks": [
                {"resource_key": "order-7", "holder": "node-a"},
                {"resource_key": "order-9", "holder": "node-b"},
            ]})
        );
    }

    #[test]
    fn compensation_waits_for_scope_lock() {
        let service = service();
        service.handle(Request::RegisterCompensation {
            scope_ref: "order-1".to_string(),
            activity_ref: "reserve".to_string(),
            action: CompensationAction::CancelTask {
                task_id: "t-1".to_string(),
            },
        });
        service
            .coordinator()
            .store()
            .set("flowguard:lock:compensation:order-1", "node-b", Duration::from_secs(60))
            .unwrap();

        let response = call(&service, json!({"type": "execute_compensation", "scope_ref": "order-1"}));
        assert_eq!(response["kind"], "conflict");
        assert_eq!(service.coordinator().compensation().pending("order-1").len(), 1);
    }

    #[test]
    fn manual_dead_letter_waits_for_running_retry() {
        let service = service();
        let recorded = call(
            &service,
            json!({"type": "record_failure", "resource_ref": "invoice-9", "error_message": "timeout"}),
        );
        let failure_id = recorded["record"]["id"].as_str().unwrap().to_string();
        service
            .coordinator()
            .store()
            .set(&format!("flowguard:lock:retry:{failure_id}"), "node-b", Duration::from_secs(60))
            .unwrap();

        let moved = call(
            &service,
            json!({"type": "move_to_dead_letter", "failure_id": failure_id, "reason": "operator escalation"}),
        );
        assert_eq!(moved["kind"], "conflict");
        assert_eq!(service.coordinator().dead_letters().stats().total, 0);
    }

    #[test]
    fn select_node_without_members_is_no_node_available() {
        let response = service().handle(Request::SelectNode {
            work_class: "default".to_string(),
        });
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::NoNodeAvailable,
                ..
            }
        ));
    }

    #[test]
    fn drain_and_resume() {
        let service = service();
        service.handle(Request::RegisterNode);
        assert_eq!(service.handle(Request::Drain), Response::Draining);
        assert_eq!(
            service.handle(Request::TryAcquireLeadership),
            Response::Leadership { leader: false }
        );
        assert_eq!(service.handle(Request::Resume), Response::Resumed { registered: true });
        assert_eq!(
            service.handle(Request::TryAcquireLeadership),
            Response::Leadership { leader: true }
        );
    }
}
