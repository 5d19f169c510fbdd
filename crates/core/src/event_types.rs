//! Event type names published on the event bus.
//!
//! Shared between the registry (publisher), the job barrier (consumer)
//! and the workflow engine.

/// Entity kinds used as the event source.
pub const ENTITY_JOB: &str = "job";
pub const ENTITY_WORKFLOW: &str = "workflow";
pub const ENTITY_SERVICE: &str = "service";

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A job record was created in `QUEUED`.
pub const JOB_CREATED: &str = "job.created";

/// A job was moved to another host while still queued.
pub const JOB_REASSIGNED: &str = "job.reassigned";

/// A job entered `RUNNING`.
pub const JOB_RUNNING: &str = "job.running";

/// A job finished successfully.
pub const JOB_FINISHED: &str = "job.finished";

/// A job failed.
pub const JOB_FAILED: &str = "job.failed";

/// A job was failed by the reaper after missing its liveness window.
pub const JOB_REAPED: &str = "job.reaped";

// ---------------------------------------------------------------------------
// Service registrations
// ---------------------------------------------------------------------------

pub const SERVICE_REGISTERED: &str = "service.registered";
pub const SERVICE_UNREGISTERED: &str = "service.unregistered";
pub const SERVICE_MAINTENANCE: &str = "service.maintenance";
pub const SERVICE_ONLINE: &str = "service.online";

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// The workflow-level state changed.
pub const WORKFLOW_STATE_CHANGED: &str = "workflow.state_changed";

/// An operation instance changed state.
pub const WORKFLOW_OPERATION_CHANGED: &str = "workflow.operation_changed";
