//! `flowguard-coordination` — cluster membership, leader election, distributed
//! locks and load balancing on top of a shared coordination store.
//!
//! ## Components
//!
//! - [`store`]: the `CoordinationStore` port with in-memory and Redis adapters
//! - [`membership`]: registration, heartbeats, discovery, eviction, draining
//! - [`leader`]: single leader via a TTL-bound lease key
//! - [`lock`]: per-resource advisory locks
//! - [`balancer`]: least-loaded node selection and scaling advice
//!
//! The store provides all mutual exclusion; this crate only sequences calls to
//! it and degrades to "not acquired" when it is unreachable.

pub mod balancer;
pub mod descriptor;
pub mod keys;
pub mod leader;
pub mod local;
pub mod lock;
pub mod membership;
pub mod store;

pub use balancer::{BalancerError, LoadBalancer, LoadReport, ScalingPolicy};
pub use descriptor::{CodecError, LoadSample, NodeDescriptor, NodeStatus};
pub use keys::KeySpace;
pub use leader::LeaderElection;
pub use local::LocalNode;
pub use lock::{DistributedLock, HeldLock, LockOutcome};
pub use membership::{ClusterMembership, HeartbeatReport, MembershipConfig, NodeDirectory};
pub use store::{CoordinationStore, InMemoryCoordinationStore, SharedStore, StoreError, StoreResult};

#[cfg(feature = "redis")]
pub use store::RedisCoordinationStore;
