//! Row mapping for the `jobs` table.

use castflow_core::error::CoreError;
use castflow_core::job::Job;
use castflow_core::status::{JobStatus, StatusId};
use castflow_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: DbId,
    pub version: i32,
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub host: Option<String>,
    pub status_id: StatusId,
    pub payload: Option<String>,
    pub error_message: Option<String>,
    pub date_created: Timestamp,
    pub date_started: Option<Timestamp>,
    pub date_completed: Option<Timestamp>,
    pub date_updated: Timestamp,
    pub queue_time_ms: Option<i64>,
    pub run_time_ms: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_id(row.status_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "Job {} has unknown status id {}",
                row.id, row.status_id
            ))
        })?;
        Ok(Job {
            id: row.id,
            version: row.version,
            job_type: row.job_type,
            operation: row.operation,
            arguments: row.arguments,
            host: row.host,
            status,
            payload: row.payload,
            error_message: row.error_message,
            date_created: row.date_created,
            date_started: row.date_started,
            date_completed: row.date_completed,
            date_updated: row.date_updated,
            queue_time_ms: row.queue_time_ms,
            run_time_ms: row.run_time_ms,
        })
    }
}
