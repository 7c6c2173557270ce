//! Wiring and lifecycle of one FlowGuard node.
//!
//! A [`Coordinator`] owns every component of the node and the three periodic
//! workers that drive them: heartbeat/leadership, retry sweep and cleanup.
//! Nothing is global; embedders inject their ports through
//! [`CoordinatorBuilder`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use flowguard_coordination::{
    ClusterMembership, DistributedLock, InMemoryCoordinationStore, LoadBalancer, LoadSample,
    LocalNode, SharedStore, StoreError,
};
use flowguard_core::{Clock, NodeId, SystemClock};
use flowguard_recovery::{
    AttemptResult, CompensationExecutor, CompensationHandler, DeadLetterQueue, FailureRecord, FailureRepository,
    InMemoryFailureRepository, Notifier, RepositoryError, RetryAction, RetryScheduler, TracingNotifier,
};
use serde_json::{Map, Value as JsonValue};

use crate::config::{Config, ConfigError};
use crate::worker::{WorkerHandle, spawn_periodic};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("coordination store: {0}")]
    Store(#[from] StoreError),

    #[error("failure repository: {0}")]
    Repository(#[from] RepositoryError),

    #[error("failed to start worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Stand-in for ports the embedder did not provide. Every call fails, so
/// records end up in the dead-letter queue for an operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

impl RetryAction for Unconfigured {
    fn retry(&self, record: &FailureRecord) -> AttemptResult {
        AttemptResult::Failure(format!("no retry action configured for {}", record.resource_ref))
    }
}

impl CompensationHandler for Unconfigured {
    fn rollback_variables(&self, _: &str, _: &str, _: &Map<String, JsonValue>) -> Result<(), String> {
        Err("no compensation handler configured".to_string())
    }

    fn cancel_task(&self, _: &str, _: &str, _: &str) -> Result<(), String> {
        Err("no compensation handler configured".to_string())
    }

    fn terminate_scope(&self, _: &str, _: &str, _: &str) -> Result<(), String> {
        Err("no compensation handler configured".to_string())
    }
}

pub struct CoordinatorBuilder {
    config: Config,
    node_id: Option<NodeId>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<SharedStore>,
    repository: Option<Arc<dyn FailureRepository>>,
    notifier: Option<Arc<dyn Notifier>>,
    retry_action: Option<Arc<dyn RetryAction>>,
    compensation_handler: Option<Arc<dyn CompensationHandler>>,
}

impl CoordinatorBuilder {
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn FailureRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn retry_action(mut self, action: Arc<dyn RetryAction>) -> Self {
        self.retry_action = Some(action);
        self
    }

    pub fn compensation_handler(mut self, handler: Arc<dyn CompensationHandler>) -> Self {
        self.compensation_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Coordinator, CoordinatorError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => connect_store(&config, clock.clone())?,
        };
        let repository = match self.repository {
            Some(repository) => repository,
            None => connect_repository(&config)?,
        };
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let retry_action = self.retry_action.unwrap_or_else(|| Arc::new(Unconfigured));
        let handler = self.compensation_handler.unwrap_or_else(|| Arc::new(Unconfigured));

        let node_id = self
            .node_id
            .unwrap_or_else(|| NodeId::generate(&config.node_host, config.node_port));
        let local = Arc::new(LocalNode::new(node_id, config.node_host.clone(), config.node_port, clock.now()));
        let keys = config.key_space();

        let membership = Arc::new(ClusterMembership::new(
            store.clone(),
            keys.clone(),
            local.clone(),
            config.membership(),
            clock.clone(),
        ));
        let locks = DistributedLock::new(store.clone(), keys, local.clone());
        let balancer = LoadBalancer::new(membership.clone());

        let compensation = Arc::new(CompensationExecutor::new(handler, clock.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            repository.clone(),
            notifier,
            compensation.clone(),
            locks.clone(),
            config.lock_ttl,
            clock.clone(),
        ));
        let retries = Arc::new(RetryScheduler::new(
            repository.clone(),
            dead_letters.clone(),
            locks.clone(),
            local.clone(),
            retry_action,
            config.retry_scheduler(),
            clock.clone(),
        ));

        info!(node_id = %local.id(), prefix = %config.key_prefix, "coordinator built");
        Ok(Coordinator {
            config,
            clock,
            store,
            local,
            membership,
            locks,
            balancer,
            repository,
            compensation,
            dead_letters,
            retries,
            active_connections: Arc::new(AtomicU32::new(0)),
            workers: Mutex::new(Vec::new()),
        })
    }
}

fn connect_store(config: &Config, clock: Arc<dyn Clock>) -> Result<SharedStore, CoordinatorError> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = flowguard_coordination::RedisCoordinationStore::new(url)?;
            info!("using redis coordination store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL is set but the redis feature is not enabled; falling back to in-memory store");
            Ok(Arc::new(InMemoryCoordinationStore::with_clock(clock)))
        }
        None => {
            info!("REDIS_URL not set; using in-memory coordination store (single node only)");
            Ok(Arc::new(InMemoryCoordinationStore::with_clock(clock)))
        }
    }
}

fn connect_repository(config: &Config) -> Result<Arc<dyn FailureRepository>, CoordinatorError> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let repository = flowguard_recovery::PostgresFailureRepository::connect(url, config.max_connections)?;
            info!("using postgres failure repository");
            Ok(Arc::new(repository))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            warn!("DATABASE_URL is set but the postgres feature is not enabled; failure records stay in memory");
            Ok(InMemoryFailureRepository::arc())
        }
        None => Ok(InMemoryFailureRepository::arc()),
    }
}

/// Counts an open connection until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    gauge: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Coordinator {
    config: Config,
    clock: Arc<dyn Clock>,
    store: SharedStore,
    local: Arc<LocalNode>,
    membership: Arc<ClusterMembership>,
    locks: DistributedLock,
    balancer: LoadBalancer<Arc<ClusterMembership>>,
    repository: Arc<dyn FailureRepository>,
    compensation: Arc<CompensationExecutor>,
    dead_letters: Arc<DeadLetterQueue>,
    retries: Arc<RetryScheduler>,
    active_connections: Arc<AtomicU32>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Coordinator {
    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            node_id: None,
            clock: None,
            store: None,
            repository: None,
            notifier: None,
            retry_action: None,
            compensation_handler: None,
        }
    }

    /// Register the node, run a first heartbeat and start the workers.
    ///
    /// Calling `start` on a running coordinator does nothing.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return Ok(());
        }

        self.membership.register_node();
        let report = self.membership.heartbeat();
        info!(node_id = %self.local.id(), leader = report.leader, "node started");

        if let Err(e) = self.dead_letters.restore() {
            warn!(error = %e, "dead-letter queue not restored");
        }

        let membership = self.membership.clone();
        let local = self.local.clone();
        let gauge = self.active_connections.clone();
        let max_connections = self.config.max_connections;
        workers.push(spawn_periodic(
            "flowguard-heartbeat",
            self.config.heartbeat_interval,
            move || {
                local.update_load(LoadSample::connections(gauge.load(Ordering::SeqCst), max_connections));
                membership.heartbeat();
            },
        )?);

        let retries = self.retries.clone();
        let clock = self.clock.clone();
        workers.push(spawn_periodic(
            "flowguard-retry-sweep",
            self.config.retry_sweep_interval,
            move || {
                retries.execute_pending_retries(clock.now());
            },
        )?);

        let retries = self.retries.clone();
        let dead_letters = self.dead_letters.clone();
        let clock = self.clock.clone();
        let retention = self.config.dlq_retention;
        workers.push(spawn_periodic(
            "flowguard-cleanup",
            self.config.dlq_cleanup_interval,
            move || {
                dead_letters.purge_processed(clock.now() - retention);
                if let Err(e) = retries.cleanup_resolved(retention) {
                    warn!(error = %e, "failure record cleanup failed");
                }
            },
        )?);

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().unwrap().is_empty()
    }

    /// Drain, stop the workers (finishing in-flight ticks) and leave the
    /// cluster.
    pub fn shutdown(&self) {
        self.membership.prepare_for_draining();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let name = worker.name().to_string();
            worker.shutdown();
            info!(worker = %name, "worker joined");
        }

        self.membership.deregister();
        info!(node_id = %self.local.id(), "node stopped");
    }

    /// Stop taking leases, locks and retries; workers keep heartbeating.
    pub fn drain(&self) {
        self.membership.prepare_for_draining();
    }

    /// Leave draining and rejoin as a follower.
    pub fn resume(&self) -> bool {
        self.membership.complete_draining()
    }

    /// Count one open client connection toward this node's load score.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            gauge: self.active_connections.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn node_id(&self) -> &NodeId {
        self.local.id()
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn locks(&self) -> &DistributedLock {
        &self.locks
    }

    pub fn balancer(&self) -> &LoadBalancer<Arc<ClusterMembership>> {
        &self.balancer
    }

    pub fn repository(&self) -> &Arc<dyn FailureRepository> {
        &self.repository
    }

    pub fn compensation(&self) -> &Arc<CompensationExecutor> {
        &self.compensation
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn retries(&self) -> &Arc<RetryScheduler> {
        &self.retries
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let running = self.workers.get_mut().map(|w| !w.is_empty()).unwrap_or(false);
        if running {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", self.local.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
