//! [`JobStore`] and [`WorkflowStore`] over PostgreSQL.

use async_trait::async_trait;
use castflow_core::error::CoreError;
use castflow_core::job::{Job, NewJob};
use castflow_core::store::{JobFilter, JobStore, WorkflowFilter, WorkflowStore};
use castflow_core::types::DbId;
use castflow_core::workflow::{NewWorkflow, WorkflowInstance};
use sqlx::PgPool;

use crate::models::workflow::operation_index;
use crate::repositories::{JobRepo, WorkflowRepo};

/// Store backed by a connection pool. Cheap to clone.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a driver error onto the domain error.
///
/// Details stay in the log; callers see a generic message.
fn db_error(err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::RowNotFound => CoreError::Internal("Row not found".to_string()),
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503") => {
            CoreError::Validation(format!(
                "Reference violates constraint {}",
                db_err.constraint().unwrap_or("unknown")
            ))
        }
        other => {
            tracing::error!(error = %other, "Database error");
            CoreError::Internal("Database error".to_string())
        }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, CoreError> {
        JobRepo::insert(&self.pool, &job)
            .await
            .map_err(db_error)?
            .try_into()
    }

    async fn find_job(&self, id: DbId) -> Result<Option<Job>, CoreError> {
        JobRepo::find_by_id(&self.pool, id)
            .await
            .map_err(db_error)?
            .map(Job::try_from)
            .transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<Job, CoreError> {
        match JobRepo::update(&self.pool, job).await.map_err(db_error)? {
            Some(row) => row.try_into(),
            None if JobRepo::exists(&self.pool, job.id).await.map_err(db_error)? => {
                Err(CoreError::Conflict(format!(
                    "Job {} was modified concurrently (expected version {})",
                    job.id, job.version
                )))
            }
            None => Err(CoreError::not_found("Job", job.id)),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        JobRepo::list(&self.pool, filter)
            .await
            .map_err(db_error)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64, CoreError> {
        JobRepo::count(&self.pool, filter).await.map_err(db_error)
    }

    async fn delete_jobs(&self, ids: &[DbId]) -> Result<u64, CoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        JobRepo::delete_many(&self.pool, ids).await.map_err(db_error)
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn insert_workflow(&self, workflow: NewWorkflow) -> Result<WorkflowInstance, CoreError> {
        WorkflowRepo::insert(&self.pool, &workflow)
            .await
            .map_err(db_error)?
            .try_into()
    }

    async fn find_workflow(&self, id: DbId) -> Result<Option<WorkflowInstance>, CoreError> {
        WorkflowRepo::find_by_id(&self.pool, id)
            .await
            .map_err(db_error)?
            .map(WorkflowInstance::try_from)
            .transpose()
    }

    async fn update_workflow(&self, workflow: &WorkflowInstance) -> Result<(), CoreError> {
        let index = operation_index(workflow.current_operation)?;
        let updated = WorkflowRepo::update(&self.pool, workflow, index)
            .await
            .map_err(db_error)?;
        if updated == 0 {
            return Err(CoreError::not_found("WorkflowInstance", workflow.id));
        }
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, CoreError> {
        WorkflowRepo::list(&self.pool, filter)
            .await
            .map_err(db_error)?
            .into_iter()
            .map(WorkflowInstance::try_from)
            .collect()
    }

    async fn count_workflows(&self, filter: &WorkflowFilter) -> Result<i64, CoreError> {
        WorkflowRepo::count(&self.pool, filter)
            .await
            .map_err(db_error)
    }

    async fn delete_workflow(&self, id: DbId) -> Result<bool, CoreError> {
        WorkflowRepo::delete(&self.pool, id).await.map_err(db_error)
    }
}
