use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{JobFilter, JobStore, WorkflowFilter, WorkflowStore};
use crate::error::CoreError;
use crate::job::{Job, NewJob};
use crate::types::DbId;
use crate::workflow::{NewWorkflow, WorkflowInstance};

/// In-process store for jobs and workflow instances.
///
/// Used when no database is configured and throughout the test suites.
/// Records are kept in id order so listings match the PostgreSQL store.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<BTreeMap<DbId, Job>>,
    workflows: RwLock<BTreeMap<DbId, WorkflowInstance>>,
    next_job_id: AtomicI64,
    next_workflow_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, CoreError> {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = job.into_job(id, Utc::now());
        self.jobs.write().await.insert(id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: DbId) -> Result<Option<Job>, CoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| CoreError::not_found("Job", job.id))?;
        if stored.version != job.version {
            return Err(CoreError::Conflict(format!(
                "Job {} was modified concurrently (version {} != {})",
                job.id, stored.version, job.version
            )));
        }
        let mut next = job.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64, CoreError> {
        let count = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .count();
        Ok(count as i64)
    }

    async fn delete_jobs(&self, ids: &[DbId]) -> Result<u64, CoreError> {
        let mut jobs = self.jobs.write().await;
        let removed = ids.iter().filter(|id| jobs.remove(id).is_some()).count();
        Ok(removed as u64)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_workflow(&self, workflow: NewWorkflow) -> Result<WorkflowInstance, CoreError> {
        let id = self.next_workflow_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = workflow.into_instance(id, Utc::now());
        self.workflows.write().await.insert(id, instance.clone());
        Ok(instance)
    }

    async fn find_workflow(&self, id: DbId) -> Result<Option<WorkflowInstance>, CoreError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn update_workflow(&self, workflow: &WorkflowInstance) -> Result<(), CoreError> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| CoreError::not_found("WorkflowInstance", workflow.id))?;
        *stored = workflow.clone();
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, CoreError> {
        Ok(self
            .workflows
            .read()
            .await
            .values()
            .filter(|wf| filter.matches(wf))
            .cloned()
            .collect())
    }

    async fn count_workflows(&self, filter: &WorkflowFilter) -> Result<i64, CoreError> {
        let count = self
            .workflows
            .read()
            .await
            .values()
            .filter(|wf| filter.matches(wf))
            .count();
        Ok(count as i64)
    }

    async fn delete_workflow(&self, id: DbId) -> Result<bool, CoreError> {
        Ok(self.workflows.write().await.remove(&id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
