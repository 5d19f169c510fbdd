//! Turns "run capability X with these arguments" into a job on a host.

use std::sync::Arc;

use castflow_core::error::CoreError;
use castflow_core::job::{Job, NewJob};
use castflow_core::status::JobStatus;
use castflow_core::types::DbId;

use crate::registry::ServiceRegistry;
use crate::transport::JobTransport;

/// Places jobs on the least loaded eligible registration and delivers them.
pub struct JobDispatcher {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn JobTransport>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, transport: Arc<dyn JobTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Create a job and hand it to the best placed producer.
    ///
    /// Fails with [`CoreError::ServiceUnavailable`] before creating any
    /// record when no registration for `job_type` is online, out of
    /// maintenance and below host capacity. If delivery to the chosen host
    /// fails the still-queued job moves to the next candidate; when every
    /// candidate refuses, the job is marked `FAILED` and returned so the
    /// caller can see what happened.
    ///
    /// Returns the job as created (`QUEUED`, host assigned). The producer
    /// may already have moved it on by the time the caller looks again.
    pub async fn create_job(
        &self,
        job_type: &str,
        operation: &str,
        arguments: Vec<String>,
    ) -> Result<Job, CoreError> {
        let candidates = self.registry.registrations_by_load(job_type).await?;
        let Some(first) = candidates.first() else {
            tracing::warn!(job_type, operation, "No eligible service for job");
            return Err(CoreError::ServiceUnavailable(format!(
                "No online service registered for job type '{job_type}'"
            )));
        };

        let mut job = self
            .registry
            .create_job(NewJob {
                job_type: job_type.to_string(),
                operation: operation.to_string(),
                arguments,
                host: Some(first.host.clone()),
            })
            .await?;

        let mut failures = Vec::new();
        for (attempt, registration) in candidates.iter().enumerate() {
            if attempt > 0 {
                let current = self.registry.get_job(job.id).await?;
                if current.status != JobStatus::Queued {
                    // An earlier host took it despite reporting an error.
                    tracing::info!(
                        job_id = job.id,
                        host = ?current.host,
                        status = %current.status,
                        "Job already picked up, not re-targeting",
                    );
                    return Ok(current);
                }
                let mut retarget = current.with_status(JobStatus::Queued);
                retarget.host = Some(registration.host.clone());
                job = match self.registry.update_job_from(&current, &retarget).await {
                    Ok(job) => job,
                    Err(CoreError::Conflict(_)) => return self.registry.get_job(job.id).await,
                    Err(e) => return Err(e),
                };
            }

            match self.transport.deliver(registration, &job).await {
                Ok(()) => {
                    tracing::info!(
                        job_id = job.id,
                        job_type,
                        operation,
                        host = %registration.host,
                        "Job dispatched",
                    );
                    return Ok(job);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = job.id,
                        host = %registration.host,
                        error = %e,
                        "Job delivery failed",
                    );
                    failures.push(format!("{}: {e}", registration.host));
                }
            }
        }

        let description = format!("Delivery failed on every host ({})", failures.join("; "));
        tracing::error!(job_id = job.id, job_type, "{description}");
        let current = self.registry.get_job(job.id).await?;
        if current.status != JobStatus::Queued {
            return Ok(current);
        }
        match self
            .registry
            .update_job_from(&current, &current.failed(description))
            .await
        {
            Err(CoreError::Conflict(_)) => self.registry.get_job(job.id).await,
            result => result,
        }
    }

    /// Persist a producer-side change to a job.
    pub async fn update_job(&self, job: &Job) -> Result<Job, CoreError> {
        self.registry.update_job(job).await
    }

    pub async fn get_job(&self, id: DbId) -> Result<Job, CoreError> {
        self.registry.get_job(id).await
    }
}
