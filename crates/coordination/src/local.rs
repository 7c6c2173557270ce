//! The local node's own identity and mutable state.
//!
//! This is the only node state a process owns; everything about other nodes is
//! read back from the coordination store. The descriptor sits behind a
//! `RwLock` because the heartbeat worker writes it while request threads read.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use flowguard_core::NodeId;

use crate::descriptor::{LoadSample, NodeDescriptor, NodeStatus};

#[derive(Debug)]
pub struct LocalNode {
    id: NodeId,
    descriptor: RwLock<NodeDescriptor>,
}

impl LocalNode {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16, now: DateTime<Utc>) -> Self {
        let descriptor = NodeDescriptor::new(id.clone(), host, port, now);
        Self {
            id,
            descriptor: RwLock::new(descriptor),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Copy of the current descriptor.
    pub fn snapshot(&self) -> NodeDescriptor {
        self.read(|d| d.clone())
    }

    pub fn status(&self) -> NodeStatus {
        self.read(|d| d.status)
    }

    pub fn is_draining(&self) -> bool {
        self.status() == NodeStatus::Draining
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.write(|d| d.status = status);
    }

    /// Move between follower and leader. A draining node keeps its status.
    pub(crate) fn set_leader(&self, leader: bool) -> Option<NodeStatus> {
        let mut previous = None;
        self.write(|d| {
            let next = match (d.status, leader) {
                (NodeStatus::Follower, true) => NodeStatus::Leader,
                (NodeStatus::Leader, false) => NodeStatus::Follower,
                (status, _) => status,
            };
            if next != d.status {
                previous = Some(d.status);
                d.status = next;
            }
        });
        previous
    }

    pub fn update_load(&self, sample: LoadSample) {
        let score = sample.score();
        self.write(|d| d.load_score = score);
    }

    pub fn record_task_processed(&self) {
        self.write(|d| d.processed_task_count = d.processed_task_count.saturating_add(1));
    }

    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        self.write(|d| d.last_heartbeat_at = now);
    }

    fn read<T>(&self, f: impl FnOnce(&NodeDescriptor) -> T) -> T {
        let guard = self.descriptor.read().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    fn write(&self, f: impl FnOnce(&mut NodeDescriptor)) {
        let mut guard = self.descriptor.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }
}
