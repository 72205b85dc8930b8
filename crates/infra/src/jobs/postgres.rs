//! Postgres-backed job store.
//!
//! One row per job in `generation_jobs`. Transitions are a single conditional
//! `UPDATE ... WHERE id = $1 AND status = 'PENDING'`, so two workers racing on
//! the same job cannot both win.
//!
//! ## Error Mapping
//!
//! | Situation | JobStoreError |
//! |-----------|---------------|
//! | conditional update matched no row, row exists | `AlreadyTerminal` |
//! | conditional update matched no row, no row | `NotFound` |
//! | row fails to decode or breaks an invariant | `Corrupt` |
//! | any other SQLx error | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use atelier_core::{Job, JobId, JobStatus, OwnerKind, OwnerRef, TransitionError};

use super::store::{JobStats, JobStore, JobStoreError};

const JOB_COLUMNS: &str =
    "id, owner_kind, owner_ref, status, result_url, failure, created_at, updated_at";

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the jobs table and its owner index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generation_jobs (
                id UUID PRIMARY KEY,
                owner_kind TEXT NOT NULL CHECK (owner_kind IN ('PROFILE_BACKGROUND', 'PRODUCT_IMAGE')),
                owner_ref BIGINT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('PENDING', 'COMPLETED', 'FAILED')),
                result_url TEXT NULL,
                failure TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK ((status = 'COMPLETED') = (result_url IS NOT NULL))
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS generation_jobs_owner_idx
                ON generation_jobs (owner_kind, owner_ref, created_at DESC)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    /// Explain why a conditional statement matched nothing.
    async fn classify_miss(&self, id: JobId) -> Result<JobStoreError, JobStoreError> {
        match self.get(id).await? {
            Some(job) => Ok(JobStoreError::AlreadyTerminal {
                id,
                status: job.status,
            }),
            None => Ok(JobStoreError::NotFound(id)),
        }
    }

    async fn finish(
        &self,
        id: JobId,
        status: JobStatus,
        result_url: Option<&str>,
        failure: Option<&str>,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET status = $2, result_url = $3, failure = $4, updated_at = $5
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(status.as_str())
            .bind(result_url)
            .bind(failure)
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish", e))?;

        match row {
            Some(row) => Job::try_from(JobRow::from_pg(&row)?),
            None => Err(self.classify_miss(id).await?),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn create(&self, owner: OwnerRef) -> Result<Job, JobStoreError> {
        let job = Job::new(owner, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO generation_jobs
                (id, owner_kind, owner_ref, status, result_url, failure, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, $5, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(owner.kind().as_str())
        .bind(owner.id())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create", e) {
            JobStoreError::Storage(msg) if msg.contains("23505") => JobStoreError::AlreadyExists(job.id),
            other => other,
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| Job::try_from(JobRow::from_pg(&row)?)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId, result_url: &str) -> Result<Job, JobStoreError> {
        if result_url.trim().is_empty() {
            return Err(TransitionError::EmptyResultUrl.into());
        }
        self.finish(id, JobStatus::Completed, Some(result_url), None).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        self.finish(id, JobStatus::Failed, None, Some(reason)).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn revoke(&self, id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM generation_jobs WHERE id = $1 AND status = 'PENDING'")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("revoke", e))?;

        if result.rows_affected() == 0 {
            return Err(self.classify_miss(id).await?);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE owner_kind = $1 AND owner_ref = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(owner.kind().as_str())
            .bind(owner.id())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_for_owner", e))?;

        rows.iter()
            .map(|row| Job::try_from(JobRow::from_pg(row)?))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM generation_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| corrupt("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| corrupt("stats", e))?;
            let n = usize::try_from(n).unwrap_or(0);
            match parse_status(&status)? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

/// Raw `generation_jobs` row.
#[derive(Debug, Clone, PartialEq)]
struct JobRow {
    id: Uuid,
    owner_kind: String,
    owner_ref: i64,
    status: String,
    result_url: Option<String>,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_pg(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        <Self as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row).map_err(|e| corrupt("decode", e))
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner_kind: row.try_get("owner_kind")?,
            owner_ref: row.try_get("owner_ref")?,
            status: row.try_get("status")?,
            result_url: row.try_get("result_url")?,
            failure: row.try_get("failure")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind: OwnerKind = row
            .owner_kind
            .parse()
            .map_err(|e| JobStoreError::Corrupt(format!("job {}: {e}", row.id)))?;
        let job = Job {
            id: JobId::from_uuid(row.id),
            owner: OwnerRef::from_parts(kind, row.owner_ref),
            status: parse_status(&row.status)?,
            result_url: row.result_url,
            failure: row.failure,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        job.validate()
            .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        Ok(job)
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e| JobStoreError::Corrupt(format!("{e}")))
}

fn corrupt(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Corrupt(format!("{operation}: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed during {operation}")),
        sqlx::Error::PoolTimedOut => JobStoreError::Storage(format!("connection pool timed out during {operation}")),
        other => JobStoreError::Storage(format!("{operation}: {other}")),
    }
}
