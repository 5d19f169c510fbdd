//! Repository for the `jobs` table.
//!
//! Updates are optimistic: a row only changes while its `version` still
//! matches the caller's copy, and every write bumps it.

use castflow_core::job::{Job, NewJob};
use castflow_core::status::JobStatus;
use castflow_core::store::JobFilter;
use castflow_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::JobRow;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, version, job_type, operation, arguments, host, status_id, \
    payload, error_message, \
    date_created, date_started, date_completed, date_updated, \
    queue_time_ms, run_time_ms";

/// WHERE clause for [`JobFilter`]; binds $1..$5 in field order.
const FILTER: &str = "\
    ($1::TEXT IS NULL OR job_type = $1) \
    AND ($2::SMALLINT IS NULL OR status_id = $2) \
    AND ($3::TEXT IS NULL OR host = $3) \
    AND ($4::TIMESTAMPTZ IS NULL OR date_updated < $4) \
    AND ($5::TIMESTAMPTZ IS NULL OR date_completed < $5)";

pub struct JobRepo;

impl JobRepo {
    /// Insert a new `QUEUED` job.
    pub async fn insert(pool: &PgPool, input: &NewJob) -> Result<JobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (job_type, operation, arguments, host, status_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&input.job_type)
            .bind(&input.operation)
            .bind(&input.arguments)
            .bind(&input.host)
            .bind(JobStatus::Queued.id())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Write every mutable column if the stored version equals
    /// `job.version`. Returns `None` when the row is gone or was changed
    /// by someone else.
    pub async fn update(pool: &PgPool, job: &Job) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET \
                version = version + 1, \
                host = $3, \
                status_id = $4, \
                payload = $5, \
                error_message = $6, \
                date_started = $7, \
                date_completed = $8, \
                date_updated = $9, \
                queue_time_ms = $10, \
                run_time_ms = $11 \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job.id)
            .bind(job.version)
            .bind(&job.host)
            .bind(job.status.id())
            .bind(&job.payload)
            .bind(&job.error_message)
            .bind(job.date_started)
            .bind(job.date_completed)
            .bind(job.date_updated)
            .bind(job.queue_time_ms)
            .bind(job.run_time_ms)
            .fetch_optional(pool)
            .await
    }

    pub async fn exists(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// Matching jobs ordered by id.
    pub async fn list(pool: &PgPool, filter: &JobFilter) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE {FILTER} ORDER BY id");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&filter.job_type)
            .bind(filter.status.map(JobStatus::id))
            .bind(&filter.host)
            .bind(filter.updated_before)
            .bind(filter.completed_before)
            .fetch_all(pool)
            .await
    }

    pub async fn count(pool: &PgPool, filter: &JobFilter) -> Result<i64, sqlx::Error> {
        let query = format!("SELECT COUNT(*) FROM jobs WHERE {FILTER}");
        sqlx::query_scalar::<_, i64>(&query)
            .bind(&filter.job_type)
            .bind(filter.status.map(JobStatus::id))
            .bind(&filter.host)
            .bind(filter.updated_before)
            .bind(filter.completed_before)
            .fetch_one(pool)
            .await
    }

    /// Delete the given jobs. Returns the number of rows removed.
    pub async fn delete_many(pool: &PgPool, ids: &[DbId]) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
