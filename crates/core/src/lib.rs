//! `flowguard-core` — shared building blocks for the coordination and recovery crates.
//!
//! This crate contains identifiers, the validation error model and the clock
//! abstraction. It performs no IO.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{CompensationId, DeadLetterId, FailureId, NodeId};

/// Fail fast when a required identifier is empty.
pub fn require_non_empty(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}
