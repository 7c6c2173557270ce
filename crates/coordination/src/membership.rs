//! Cluster membership: registration, heartbeats, discovery and eviction.
//!
//! Each node owns two entries in the store:
//! - a field in the registry hash holding its encoded descriptor
//! - a heartbeat key with TTL = 2 x heartbeat interval
//!
//! A node is alive exactly while its heartbeat key exists. Registry fields
//! outlive their heartbeat key (hash fields carry no TTL) and are swept by
//! whichever node runs its heartbeat next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use flowguard_core::{Clock, NodeId};

use crate::descriptor::{self, NodeDescriptor, NodeStatus};
use crate::keys::KeySpace;
use crate::leader::LeaderElection;
use crate::local::LocalNode;
use crate::store::{SharedStore, StoreError};

/// Membership timing.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    pub leader_lease_ttl: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            leader_lease_ttl: Duration::from_secs(30),
        }
    }
}

impl MembershipConfig {
    /// Heartbeat keys live for two intervals so one missed tick is tolerated.
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Outcome of one heartbeat tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HeartbeatReport {
    /// Descriptor and heartbeat key were written.
    pub published: bool,
    /// This node held the leader lease after the tick.
    pub leader: bool,
    /// Registry entries removed because their heartbeat key was gone.
    pub evicted: Vec<NodeId>,
}

/// Read access to live nodes (used by the load balancer).
pub trait NodeDirectory: Send + Sync {
    fn active_nodes(&self) -> Vec<NodeDescriptor>;
}

pub struct ClusterMembership {
    store: SharedStore,
    keys: KeySpace,
    local: Arc<LocalNode>,
    leader: LeaderElection,
    config: MembershipConfig,
    clock: Arc<dyn Clock>,
    registered: AtomicBool,
    last_known: RwLock<Vec<NodeDescriptor>>,
}

impl ClusterMembership {
    pub fn new(
        store: SharedStore,
        keys: KeySpace,
        local: Arc<LocalNode>,
        config: MembershipConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let leader = LeaderElection::new(
            store.clone(),
            keys.clone(),
            local.clone(),
            config.leader_lease_ttl,
        );
        Self {
            store,
            keys,
            local,
            leader,
            config,
            clock,
            registered: AtomicBool::new(false),
            last_known: RwLock::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn node_id(&self) -> &NodeId {
        self.local.id()
    }

    pub fn leadership(&self) -> &LeaderElection {
        &self.leader
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Publish this node's descriptor and heartbeat key.
    ///
    /// Idempotent. A store failure is logged and reported as `false`; the next
    /// heartbeat tries again, so startup never depends on the store being up.
    pub fn register_node(&self) -> bool {
        self.local.touch(self.clock.now());
        match self.publish() {
            Ok(()) => {
                if !self.registered.swap(true, Ordering::SeqCst) {
                    info!(node_id = %self.local.id(), "node registered");
                }
                true
            }
            Err(e) => {
                self.registered.store(false, Ordering::SeqCst);
                warn!(node_id = %self.local.id(), error = %e, "node registration failed; will retry on next heartbeat");
                false
            }
        }
    }

    /// One heartbeat tick: leadership attempt, descriptor refresh, registry sweep.
    #[instrument(skip(self), fields(node_id = %self.local.id()))]
    pub fn heartbeat(&self) -> HeartbeatReport {
        let leader = self.leader.try_acquire_leadership();

        let published = if self.is_registered() {
            self.local.touch(self.clock.now());
            match self.publish() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "heartbeat refresh failed");
                    false
                }
            }
        } else {
            self.register_node()
        };

        let evicted = if published { self.evict_expired() } else { Vec::new() };

        debug!(published, leader, evicted = evicted.len(), "heartbeat");
        HeartbeatReport {
            published,
            leader,
            evicted,
        }
    }

    /// Live descriptors. Falls back to the last successful listing when the
    /// store cannot be read.
    pub fn list_active_nodes(&self) -> Vec<NodeDescriptor> {
        match self.read_active_nodes() {
            Ok(nodes) => {
                let mut cache = self.last_known.write().unwrap_or_else(|p| p.into_inner());
                *cache = nodes.clone();
                nodes
            }
            Err(e) => {
                warn!(node_id = %self.local.id(), error = %e, "listing nodes failed; serving last known snapshot");
                self.last_known.read().unwrap_or_else(|p| p.into_inner()).clone()
            }
        }
    }

    /// True iff a fresh heartbeat key exists for `node_id`.
    pub fn is_node_alive(&self, node_id: &NodeId) -> bool {
        match self.store.get(&self.keys.heartbeat(node_id.as_str())) {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "liveness check failed; using last known snapshot");
                self.last_known
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .iter()
                    .any(|n| &n.node_id == node_id)
            }
        }
    }

    pub fn try_acquire_leadership(&self) -> bool {
        self.leader.try_acquire_leadership()
    }

    pub fn release_leadership(&self) -> bool {
        self.leader.release_leadership()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.leader.current_leader()
    }

    /// Stop taking leases and new work; in-flight work continues.
    pub fn prepare_for_draining(&self) {
        self.local.set_status(NodeStatus::Draining);
        self.leader.release_leadership();
        if let Err(e) = self.publish() {
            warn!(node_id = %self.local.id(), error = %e, "failed to publish draining status");
        }
        info!(node_id = %self.local.id(), "node draining");
    }

    /// Return to service as a follower after a redeploy.
    pub fn complete_draining(&self) -> bool {
        self.local.set_status(NodeStatus::Follower);
        info!(node_id = %self.local.id(), "draining complete");
        self.register_node()
    }

    /// Graceful shutdown: drop lease, heartbeat key and registry entry.
    pub fn deregister(&self) {
        let node_id = self.local.id().as_str();
        self.leader.release_leadership();

        let heartbeat = self.store.delete(&self.keys.heartbeat(node_id));
        let registry = self.store.hash_delete(&self.keys.registry(), node_id);
        match (heartbeat, registry) {
            (Ok(_), Ok(_)) => info!(node_id, "node deregistered"),
            (Err(e), _) | (_, Err(e)) => warn!(node_id, error = %e, "deregistration incomplete; entries will expire"),
        }
        self.registered.store(false, Ordering::SeqCst);
    }

    fn publish(&self) -> Result<(), StoreError> {
        let node = self.local.snapshot();
        let encoded = descriptor::encode(&node).map_err(|e| StoreError::Backend(e.to_string()))?;
        let node_id = node.node_id.as_str();

        self.store
            .set(&self.keys.heartbeat(node_id), node_id, self.config.heartbeat_ttl())?;
        self.store.hash_put(&self.keys.registry(), node_id, &encoded)?;
        Ok(())
    }

    fn read_active_nodes(&self) -> Result<Vec<NodeDescriptor>, StoreError> {
        let entries = self.store.hash_entries(&self.keys.registry())?;
        let mut nodes = Vec::with_capacity(entries.len());

        for (field, raw) in entries {
            if self.store.get(&self.keys.heartbeat(&field))?.is_none() {
                continue;
            }
            match descriptor::decode(&raw) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(node_id = %field, error = %e, "skipping undecodable node descriptor"),
            }
        }

        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    /// Remove registry entries whose heartbeat key has expired.
    fn evict_expired(&self) -> Vec<NodeId> {
        let registry = self.keys.registry();
        let entries = match self.store.hash_entries(&registry) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "registry sweep skipped");
                return Vec::new();
            }
        };

        let mut evicted = Vec::new();
        for field in entries.into_keys() {
            if field == self.local.id().as_str() {
                continue;
            }
            match self.store.get(&self.keys.heartbeat(&field)) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Ok(true) = self.store.hash_delete(&registry, &field) {
                        info!(evicted_node = %field, "evicted expired node");
                        if let Ok(id) = field.parse() {
                            evicted.push(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "registry sweep interrupted");
                    break;
                }
            }
        }
        evicted.sort();
        evicted
    }
}

impl NodeDirectory for ClusterMembership {
    fn active_nodes(&self) -> Vec<NodeDescriptor> {
        self.list_active_nodes()
    }
}

impl<D> NodeDirectory for Arc<D>
where
    D: NodeDirectory + ?Sized,
{
    fn active_nodes(&self) -> Vec<NodeDescriptor> {
        (**self).active_nodes()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flowguard_core::ManualClock;

    use super::*;
    use crate::descriptor::LoadSample;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};

    struct Cluster {
        store: Arc<InMemoryCoordinationStore>,
        clock: Arc<ManualClock>,
    }

    impl Cluster {
        fn new() -> Self {
            let clock = ManualClock::starting_now();
            let store = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
            Self { store, clock }
        }

        fn node(&self, name: &str) -> ClusterMembership {
            let local = Arc::new(LocalNode::new(name.parse().unwrap(), "10.0.0.1", 7000, Utc::now()));
            ClusterMembership::new(
                self.store.clone(),
                KeySpace::new("test"),
                local,
                MembershipConfig::default(),
                self.clock.clone(),
            )
        }

        fn advance_secs(&self, secs: i64) {
            self.clock.advance(chrono::Duration::seconds(secs));
        }
    }

    fn ids(nodes: &[NodeDescriptor]) -> Vec<&str> {
        nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    #[test]
    fn registration_is_idempotent_and_discoverable() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");

        assert!(a.register_node());
        assert!(a.register_node());
        assert!(b.register_node());

        assert_eq!(ids(&a.list_active_nodes()), vec!["a", "b"]);
        assert!(a.is_node_alive(b.node_id()));
    }

    #[test]
    fn registration_failure_does_not_panic_and_heartbeat_retries() {
        let cluster = Cluster::new();
        let a = cluster.node("a");

        cluster.store.set_available(false);
        assert!(!a.register_node());
        assert!(!a.is_registered());

        cluster.store.set_available(true);
        let report = a.heartbeat();
        assert!(report.published);
        assert!(a.is_registered());
        assert!(report.leader);
    }

    #[test]
    fn silent_node_expires_and_is_evicted() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");
        a.heartbeat();
        b.heartbeat();

        // b stops heartbeating; a keeps going past 2 x interval.
        cluster.advance_secs(10);
        a.heartbeat();
        cluster.advance_secs(10);
        let report = a.heartbeat();

        assert_eq!(ids(&a.list_active_nodes()), vec!["a"]);
        assert!(!a.is_node_alive(b.node_id()));
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].as_str(), "b");
        assert!(cluster.store.hash_get("test:nodes", "b").unwrap().is_none());
    }

    #[test]
    fn dead_leader_lease_fails_over_after_ttl() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");

        assert!(a.heartbeat().leader);
        assert!(!b.heartbeat().leader);

        // a crashes. Lease TTL is 30s; b heartbeats every 10s.
        cluster.advance_secs(10);
        assert!(!b.heartbeat().leader);
        cluster.advance_secs(10);
        assert!(!b.heartbeat().leader);
        cluster.advance_secs(11);
        assert!(b.heartbeat().leader);
        assert_eq!(b.current_leader().unwrap().as_str(), "b");
    }

    #[test]
    fn listing_falls_back_to_last_known_snapshot() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");
        a.register_node();
        b.register_node();
        assert_eq!(a.list_active_nodes().len(), 2);

        cluster.store.set_available(false);
        assert_eq!(ids(&a.list_active_nodes()), vec!["a", "b"]);
        assert!(a.is_node_alive(b.node_id()));
        let report = a.heartbeat();
        assert!(!report.published);
        assert!(!report.leader);
    }

    #[test]
    fn heartbeat_publishes_fresh_load() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        a.register_node();

        a.local().update_load(LoadSample::connections(30, 100));
        a.heartbeat();

        let nodes = a.list_active_nodes();
        assert_eq!(nodes[0].load_score, 0.3);
        assert_eq!(nodes[0].status, NodeStatus::Leader);
    }

    #[test]
    fn draining_releases_leadership_and_recovers_as_follower() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");
        assert!(a.heartbeat().leader);
        b.heartbeat();

        a.prepare_for_draining();
        assert!(a.current_leader().is_none());
        assert!(!a.heartbeat().leader);
        assert_eq!(a.local().status(), NodeStatus::Draining);
        assert!(b.heartbeat().leader);

        let published = a.list_active_nodes();
        let a_view = published.iter().find(|n| n.node_id.as_str() == "a").unwrap();
        assert_eq!(a_view.status, NodeStatus::Draining);

        assert!(a.complete_draining());
        assert_eq!(a.local().status(), NodeStatus::Follower);
        assert!(!a.heartbeat().leader);
    }

    #[test]
    fn deregister_removes_node_immediately() {
        let cluster = Cluster::new();
        let a = cluster.node("a");
        let b = cluster.node("b");
        a.heartbeat();
        b.heartbeat();

        a.deregister();
        assert_eq!(ids(&b.list_active_nodes()), vec!["b"]);
        assert!(a.current_leader().is_none());
        assert!(!a.is_registered());
    }
}
