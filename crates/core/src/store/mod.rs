//! Persistence collaborator contracts for jobs and workflow instances.
//!
//! [`MemoryStore`] is the in-process implementation; `castflow-db`
//! provides the PostgreSQL one.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::job::{Job, NewJob};
use crate::status::{JobStatus, WorkflowState};
use crate::types::{DbId, Timestamp};
use crate::workflow::{NewWorkflow, WorkflowInstance};

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filter for listing and counting jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub host: Option<String>,
    /// Only jobs whose last update is strictly older than this.
    pub updated_before: Option<Timestamp>,
    /// Only jobs completed strictly before this.
    pub completed_before: Option<Timestamp>,
}

impl JobFilter {
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn updated_before(mut self, at: Timestamp) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn completed_before(mut self, at: Timestamp) -> Self {
        self.completed_before = Some(at);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
            && self.status.is_none_or(|s| job.status == s)
            && self
                .host
                .as_ref()
                .is_none_or(|h| job.host.as_deref() == Some(h.as_str()))
            && self.updated_before.is_none_or(|at| job.date_updated < at)
            && self
                .completed_before
                .is_none_or(|at| job.date_completed.is_some_and(|c| c < at))
    }
}

/// Filter for listing and counting workflow instances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowFilter {
    pub state: Option<WorkflowState>,
    /// Name of the operation the instance is currently positioned on.
    pub current_operation: Option<String>,
    pub definition_id: Option<String>,
    pub parent_id: Option<DbId>,
}

impl WorkflowFilter {
    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_current_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operation = Some(operation.into());
        self
    }

    pub fn with_definition(mut self, definition_id: impl Into<String>) -> Self {
        self.definition_id = Some(definition_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: DbId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn matches(&self, wf: &WorkflowInstance) -> bool {
        self.state.is_none_or(|s| wf.state == s)
            && self
                .current_operation
                .as_deref()
                .is_none_or(|op| wf.current_operation_name() == Some(op))
            && self
                .definition_id
                .as_ref()
                .is_none_or(|d| &wf.definition_id == d)
            && self.parent_id.is_none_or(|p| wf.parent_id == Some(p))
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Durable storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `QUEUED` job and assign its id.
    async fn insert_job(&self, job: NewJob) -> Result<Job, CoreError>;

    async fn find_job(&self, id: DbId) -> Result<Option<Job>, CoreError>;

    /// Replace the stored job if its version still equals `job.version`.
    ///
    /// Returns the stored record with the version incremented,
    /// [`CoreError::Conflict`] if another writer got there first, or
    /// [`CoreError::NotFound`] if the job is gone.
    async fn update_job(&self, job: &Job) -> Result<Job, CoreError>;

    /// Matching jobs ordered by id.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError>;

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64, CoreError>;

    /// Delete the given jobs, returning how many existed.
    async fn delete_jobs(&self, ids: &[DbId]) -> Result<u64, CoreError>;
}

/// Durable storage for workflow instance records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a new `INSTANTIATED` instance and assign its id.
    async fn insert_workflow(&self, workflow: NewWorkflow) -> Result<WorkflowInstance, CoreError>;

    async fn find_workflow(&self, id: DbId) -> Result<Option<WorkflowInstance>, CoreError>;

    /// Replace the stored instance. [`CoreError::NotFound`] if it is gone.
    async fn update_workflow(&self, workflow: &WorkflowInstance) -> Result<(), CoreError>;

    /// Matching instances ordered by id.
    async fn list_workflows(&self, filter: &WorkflowFilter)
        -> Result<Vec<WorkflowInstance>, CoreError>;

    async fn count_workflows(&self, filter: &WorkflowFilter) -> Result<i64, CoreError>;

    /// Delete an instance, returning whether it existed.
    async fn delete_workflow(&self, id: DbId) -> Result<bool, CoreError>;
}
