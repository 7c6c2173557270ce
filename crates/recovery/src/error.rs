use flowguard_core::CoreError;

use crate::repository::RepositoryError;

/// Errors from the recovery components.
///
/// Contention, missing records and already-processed messages are reported
/// through outcome enums, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
