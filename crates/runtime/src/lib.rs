//! `flowguard-runtime` — one FlowGuard node: configuration, the
//! [`Coordinator`] that owns every component and its periodic workers, and
//! the request/response [`Service`] facade.

pub mod config;
pub mod coordinator;
pub mod service;
pub mod worker;

pub use config::{Config, ConfigError};
pub use coordinator::{ConnectionGuard, Coordinator, CoordinatorBuilder, CoordinatorError, Unconfigured};
pub use service::{ErrorKind, Request, Response, Service};
pub use worker::{WorkerHandle, spawn_periodic};
