//! Core error model.

use thiserror::Error;

/// Result type used for input validation across the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

/// Programmer-error style failures.
///
/// Expected runtime outcomes (lock contention, missing records, already
/// processed entries) are modelled as outcome enums by the owning component,
/// not as errors here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A required input was missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
