//! Failure recovery: retry scheduling with backoff, the dead-letter queue and
//! compensating transactions.
//!
//! Failure records live behind the [`FailureRepository`] port. Dead-letter
//! messages are kept in memory and rebuilt from parked records on start.
//! Compensation transactions do not survive a restart.

pub mod compensation;
pub mod dead_letter;
pub mod error;
pub mod failure;
pub mod notify;
pub mod policy;
pub mod repository;
pub mod retry;

pub use compensation::{
    CompensationAction, CompensationExecutor, CompensationHandler, CompensationKind, CompensationReport,
    CompensationResult, CompensationTransaction,
};
pub use dead_letter::{DeadLetterAction, DeadLetterMessage, DeadLetterQueue, DeadLetterStats, ResolveOutcome};
pub use error::{RecoveryError, RecoveryResult};
pub use failure::{FailureClass, FailureRecord, FailureStatus, NewFailure, ResolutionMethod, RetryAttempt, Severity};
pub use notify::{Notifier, NotifyError, RecordingNotifier, TracingNotifier};
pub use policy::{BackoffStrategy, RetryPolicy};
pub use repository::{FailureRepository, InMemoryFailureRepository, RepositoryError};
pub use retry::{
    AttemptResult, RetryAction, RetryOutcome, RetryScheduler, RetrySchedulerConfig, RetryStats, SweepEntry, SweepReport,
};

#[cfg(feature = "postgres")]
pub use repository::postgres::PostgresFailureRepository;
