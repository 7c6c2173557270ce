//! Leader election over a single TTL-bound lease key.
//!
//! Acquisition is `set_if_absent(leader_key, self, ttl)`. A node that already
//! holds the lease renews it with `expire_if_equals`, so it only extends a
//! lease whose value is still its own id. When the store does that
//! comparison server-side (in-memory, Redis) no other node can slip in
//! between the check and the renewal; with the default trait implementation
//! there is a window of one round trip where an expiring lease can be taken
//! over, and the old holder then observes `false` on its next tick.
//!
//! A crashed or partitioned leader needs no explicit hand-off: the key
//! expires after `lease_ttl` and the next contender wins it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use flowguard_core::NodeId;

use crate::descriptor::NodeStatus;
use crate::keys::KeySpace;
use crate::local::LocalNode;
use crate::store::SharedStore;

pub struct LeaderElection {
    store: SharedStore,
    keys: KeySpace,
    local: Arc<LocalNode>,
    lease_ttl: Duration,
}

impl LeaderElection {
    pub fn new(store: SharedStore, keys: KeySpace, local: Arc<LocalNode>, lease_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            local,
            lease_ttl,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Try to win or renew the lease. Returns whether this node is leader
    /// after the call.
    ///
    /// Draining nodes never take the lease and give up one they hold.
    pub fn try_acquire_leadership(&self) -> bool {
        let node_id = self.local.id().as_str();

        if self.local.is_draining() {
            self.release_leadership();
            return false;
        }

        let key = self.keys.leader();
        let leader = match self.store.set_if_absent(&key, node_id, self.lease_ttl) {
            Ok(true) => true,
            Ok(false) => match self.store.expire_if_equals(&key, node_id, self.lease_ttl) {
                Ok(renewed) => renewed,
                Err(e) => {
                    warn!(node_id, error = %e, "leader lease renewal failed");
                    false
                }
            },
            Err(e) => {
                warn!(node_id, error = %e, "leader lease acquisition failed");
                false
            }
        };

        self.apply(leader);
        leader
    }

    /// Delete the lease if this node holds it.
    pub fn release_leadership(&self) -> bool {
        let node_id = self.local.id().as_str();
        let released = match self.store.delete_if_equals(&self.keys.leader(), node_id) {
            Ok(released) => released,
            Err(e) => {
                warn!(node_id, error = %e, "leader lease release failed");
                false
            }
        };

        if released {
            info!(node_id, "released leadership");
        }
        self.apply(false);
        released
    }

    /// Current lease holder according to the store.
    pub fn current_leader(&self) -> Option<NodeId> {
        match self.store.get(&self.keys.leader()) {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                warn!(node_id = %self.local.id(), error = %e, "failed to read leader lease");
                None
            }
        }
    }

    /// Local view: did the last attempt leave this node as leader?
    pub fn is_leader(&self) -> bool {
        self.local.status() == NodeStatus::Leader
    }

    fn apply(&self, leader: bool) {
        let node_id = self.local.id().as_str();
        match self.local.set_leader(leader) {
            Some(NodeStatus::Follower) => info!(node_id, "became leader"),
            Some(NodeStatus::Leader) => warn!(node_id, "lost leadership"),
            _ => debug!(node_id, leader, "leadership unchanged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::Utc;
    use flowguard_core::ManualClock;

    use super::*;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};

    const TTL: Duration = Duration::from_secs(30);

    fn contender(store: SharedStore, name: &str) -> LeaderElection {
        let local = Arc::new(LocalNode::new(name.parse().unwrap(), "127.0.0.1", 80, Utc::now()));
        LeaderElection::new(store, KeySpace::new("test"), local, TTL)
    }

    #[test]
    fn first_contender_wins_and_renews() {
        let store: SharedStore = InMemoryCoordinationStore::arc();
        let a = contender(store.clone(), "a");
        let b = contender(store.clone(), "b");

        assert!(a.try_acquire_leadership());
        assert!(!b.try_acquire_leadership());
        assert!(a.try_acquire_leadership());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(a.current_leader().unwrap().as_str(), "a");
    }

    #[test]
    fn renewal_keeps_others_out_while_fresh() {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        let a = contender(store.clone(), "a");
        let b = contender(store.clone(), "b");

        assert!(a.try_acquire_leadership());
        for _ in 0..5 {
            clock.advance(chrono::Duration::seconds(20));
            assert!(a.try_acquire_leadership());
            assert!(!b.try_acquire_leadership());
        }
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        let a = contender(store.clone(), "a");
        let b = contender(store.clone(), "b");

        assert!(a.try_acquire_leadership());
        clock.advance(chrono::Duration::seconds(31));

        assert!(b.try_acquire_leadership());
        assert!(!a.try_acquire_leadership());
        assert!(!a.is_leader());
    }

    #[test]
    fn release_only_removes_own_lease() {
        let store: SharedStore = InMemoryCoordinationStore::arc();
        let a = contender(store.clone(), "a");
        let b = contender(store.clone(), "b");

        assert!(a.try_acquire_leadership());
        assert!(!b.release_leadership());
        assert_eq!(a.current_leader().unwrap().as_str(), "a");
        assert!(a.release_leadership());
        assert!(a.current_leader().is_none());
        assert!(b.try_acquire_leadership());
    }

    #[test]
    fn draining_node_gives_up_the_lease() {
        let store: SharedStore = InMemoryCoordinationStore::arc();
        let a = contender(store.clone(), "a");
        assert!(a.try_acquire_leadership());

        a.local.set_status(NodeStatus::Draining);
        assert!(!a.try_acquire_leadership());
        assert!(a.current_leader().is_none());
        assert_eq!(a.local.status(), NodeStatus::Draining);
    }

    #[test]
    fn store_outage_means_not_leader() {
        let store = InMemoryCoordinationStore::arc();
        let a = contender(store.clone(), "a");
        assert!(a.try_acquire_leadership());

        store.set_available(false);
        assert!(!a.try_acquire_leadership());
        assert!(!a.is_leader());

        store.set_available(true);
        assert!(a.try_acquire_leadership());
        assert!(store.get("test:leader").unwrap().is_some());
    }

    #[test]
    fn concurrent_contenders_elect_exactly_one_leader() {
        const K: usize = 8;
        let store: SharedStore = InMemoryCoordinationStore::arc();
        let barrier = Arc::new(Barrier::new(K));

        let handles: Vec<_> = (0..K)
            .map(|i| {
                let election = contender(store.clone(), &format!("node-{i}"));
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut wins = 0;
                    for _ in 0..50 {
                        if election.try_acquire_leadership() {
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|wins| *wins > 0)
            .count();
        assert_eq!(winners, 1);
    }
}
