//! Postgres-backed failure repository.
//!
//! Each record is stored as a JSONB document next to the columns the sweep
//! and the cleanup filter on (`status`, `next_retry_at`, `updated_at`).
//!
//! The repository trait is synchronous. The adapter owns a small Tokio
//! runtime and blocks on it, so it must be called from plain threads (the
//! coordinator workers), never from inside another async runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) |
//! | Anything else | Any | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Runtime;
use tracing::instrument;

use flowguard_core::FailureId;

use super::{FailureRepository, RepositoryError};
use crate::failure::{FailureRecord, FailureStatus};

const SCHEMA: &str = include_str!("../../migrations/0001_failure_records.sql");

pub struct PostgresFailureRepository {
    pool: PgPool,
    runtime: Runtime,
}

impl PostgresFailureRepository {
    /// Connect to `database_url` and make sure the table exists.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("flowguard-pg")
            .build()
            .map_err(|e| RepositoryError::Storage(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let repository = Self { pool, runtime };
        repository.migrate()?;
        Ok(repository)
    }

    pub fn migrate(&self) -> Result<(), RepositoryError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<FailureRecord>, RepositoryError> {
        rows.into_iter()
            .map(|row| {
                row.try_get::<Json<FailureRecord>, _>("record")
                    .map(|Json(record)| record)
                    .map_err(|e| RepositoryError::Storage(format!("failed to decode failure record: {e}")))
            })
            .collect()
    }
}

impl std::fmt::Debug for PostgresFailureRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresFailureRepository").finish_non_exhaustive()
    }
}

impl FailureRepository for PostgresFailureRepository {
    #[instrument(skip(self, record), fields(failure_id = %record.id), err)]
    fn create(&self, record: FailureRecord) -> Result<FailureId, RepositoryError> {
        let result = self.runtime.block_on(
            sqlx::query(
                r#"
                INSERT INTO failure_records (id, status, next_retry_at, created_at, updated_at, record)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(record.status.as_str())
            .bind(record.next_retry_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(Json(&record))
            .execute(&self.pool),
        );

        match result {
            Ok(_) => Ok(record.id),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(RepositoryError::AlreadyExists(record.id))
            }
            Err(e) => Err(map_sqlx_error("create", e)),
        }
    }

    #[instrument(skip(self, record), fields(failure_id = %record.id), err)]
    fn update(&self, record: &FailureRecord) -> Result<(), RepositoryError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE failure_records
                    SET status = $2, next_retry_at = $3, updated_at = $4, record = $5
                    WHERE id = $1
                    "#,
                )
                .bind(record.id.as_uuid())
                .bind(record.status.as_str())
                .bind(record.next_retry_at)
                .bind(record.updated_at)
                .bind(Json(record))
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(record.id));
        }
        Ok(())
    }

    fn find_by_id(&self, id: FailureId) -> Result<Option<FailureRecord>, RepositoryError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query("SELECT record FROM failure_records WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        Ok(Self::decode_rows(rows)?.into_iter().next())
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT record FROM failure_records
                    WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
                    ORDER BY next_retry_at ASC, id ASC
                    LIMIT $2
                    "#,
                )
                .bind(now)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_due", e))?;

        Self::decode_rows(rows)
    }

    fn list(&self, status: Option<FailureStatus>, limit: usize) -> Result<Vec<FailureRecord>, RepositoryError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT record FROM failure_records
                    WHERE ($1::TEXT IS NULL OR status = $1)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    "#,
                )
                .bind(status.map(FailureStatus::as_str))
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    DELETE FROM failure_records
                    WHERE status IN ('resolved', 'ignored') AND updated_at < $1
                    "#,
                )
                .bind(cutoff)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        Ok(result.rows_affected() as usize)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => RepositoryError::Storage(format!("connection pool closed during {operation}")),
        other => RepositoryError::Storage(format!("{operation} failed: {other}")),
    }
}
