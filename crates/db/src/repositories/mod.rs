pub mod job_repo;
pub mod workflow_repo;

pub use job_repo::JobRepo;
pub use workflow_repo::WorkflowRepo;
