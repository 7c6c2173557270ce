//! Failure record storage.

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use flowguard_core::FailureId;

use crate::failure::{FailureRecord, FailureStatus};

/// Failure record store abstraction.
pub trait FailureRepository: Send + Sync {
    /// Persist a new record.
    fn create(&self, record: FailureRecord) -> Result<FailureId, RepositoryError>;

    /// Replace an existing record.
    fn update(&self, record: &FailureRecord) -> Result<(), RepositoryError>;

    fn find_by_id(&self, id: FailureId) -> Result<Option<FailureRecord>, RepositoryError>;

    /// Pending records whose `next_retry_at` is at or before `now`, oldest
    /// due first.
    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError>;

    /// Records in creation order, optionally filtered by status.
    fn list(&self, status: Option<FailureStatus>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError>;

    /// Delete resolved or ignored records last updated before `cutoff`.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("failure record not found: {0}")]
    NotFound(FailureId),
    #[error("failure record already exists: {0}")]
    AlreadyExists(FailureId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T: FailureRepository + ?Sized> FailureRepository for Arc<T> {
    fn create(&self, record: FailureRecord) -> Result<FailureId, RepositoryError> {
        (**self).create(record)
    }

    fn update(&self, record: &FailureRecord) -> Result<(), RepositoryError> {
        (**self).update(record)
    }

    fn find_by_id(&self, id: FailureId) -> Result<Option<FailureRecord>, RepositoryError> {
        (**self).find_by_id(id)
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        (**self).find_due(now, limit)
    }

    fn list(&self, status: Option<FailureStatus>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        (**self).list(status, limit)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        (**self).delete_older_than(cutoff)
    }
}

/// In-memory failure repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFailureRepository {
    records: RwLock<HashMap<FailureId, FailureRecord>>,
}

impl InMemoryFailureRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl FailureRepository for InMemoryFailureRepository {
    fn create(&self, record: FailureRecord) -> Result<FailureId, RepositoryError> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.id) {
            return Err(RepositoryError::AlreadyExists(record.id));
        }
        let id = record.id;
        records.insert(id, record);
        Ok(id)
    }

    fn update(&self, record: &FailureRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.id)),
        }
    }

    fn find_by_id(&self, id: FailureId) -> Result<Option<FailureRecord>, RepositoryError> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        let records = self.records.read().unwrap();
        let mut due: Vec<_> = records.values().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by_key(|r| (r.next_retry_at, r.id));
        due.truncate(limit);
        Ok(due)
    }

    fn list(&self, status: Option<FailureStatus>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        let records = self.records.read().unwrap();
        let mut result: Vec<_> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        result.sort_by_key(|r| (r.created_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, r| !(r.is_terminal() && r.updated_at < cutoff));
        Ok(before - records.len())
    }
}
