//! Dispatch a job for the operation and wait for its result.
//!
//! Configuration keys:
//!
//! | Key             | Required | Meaning |
//! |-----------------|----------|---------|
//! | `job-type`      | yes      | Service type to dispatch to |
//! | `operation`     | yes      | Operation name on the producer |
//! | `arguments`     | no       | Comma-separated job arguments |
//! | `source-flavor` | no       | URI of the first matching element becomes the first argument |
//! | `target-flavor` | no       | Flavor of the element added for the payload (default `{job-type}/output`) |
//! | `element-kind`  | no       | `track`, `catalog` or `attachment` (default) |

use std::sync::Arc;

use async_trait::async_trait;
use castflow_core::job::Job;
use castflow_core::media_package::{ElementKind, MediaPackageElement};
use castflow_core::status::JobStatus;
use castflow_core::workflow::WorkflowInstance;
use castflow_serviceregistry::{JobBarrier, JobDispatcher};

use crate::handler::{OperationError, OperationHandler, OperationResult};

pub const KEY_JOB_TYPE: &str = "job-type";
pub const KEY_OPERATION: &str = "operation";
pub const KEY_ARGUMENTS: &str = "arguments";
pub const KEY_SOURCE_FLAVOR: &str = "source-flavor";
pub const KEY_TARGET_FLAVOR: &str = "target-flavor";
pub const KEY_ELEMENT_KIND: &str = "element-kind";

/// Runs one job per operation and adds its payload to the media package.
pub struct DispatchJobHandler {
    dispatcher: Arc<JobDispatcher>,
    barrier: JobBarrier,
}

impl DispatchJobHandler {
    pub fn new(dispatcher: Arc<JobDispatcher>, barrier: JobBarrier) -> Self {
        Self {
            dispatcher,
            barrier,
        }
    }
}

#[async_trait]
impl OperationHandler for DispatchJobHandler {
    async fn start(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        let op = workflow
            .current()
            .ok_or_else(|| OperationError::Failed("No current operation".to_string()))?;
        let job_type = op.required_configuration(KEY_JOB_TYPE)?;
        let operation = op.required_configuration(KEY_OPERATION)?;
        let kind: ElementKind = op
            .configuration(KEY_ELEMENT_KIND)
            .unwrap_or("attachment")
            .parse()
            .map_err(|e: castflow_core::error::CoreError| {
                OperationError::InvalidConfiguration(e.to_string())
            })?;
        let target_flavor = op
            .configuration(KEY_TARGET_FLAVOR)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{job_type}/output"));

        let mut arguments = Vec::new();
        if let Some(flavor) = op.configuration(KEY_SOURCE_FLAVOR) {
            let source = workflow
                .media_package
                .elements_by_flavor(flavor)
                .find_map(|e| e.uri.clone())
                .ok_or_else(|| {
                    OperationError::Failed(format!("No element with flavor '{flavor}' to process"))
                })?;
            arguments.push(source);
        }
        arguments.extend(split_arguments(op.configuration(KEY_ARGUMENTS).unwrap_or("")));

        let job = self
            .dispatcher
            .create_job(job_type, operation, arguments)
            .await?;
        if job.status == JobStatus::Failed {
            return Err(job_failed(&job));
        }
        tracing::debug!(
            workflow_id = workflow.id,
            operation = %op.name,
            job_id = job.id,
            "Waiting for job",
        );
        let job = self
            .barrier
            .wait_for_job(job.id)
            .await
            .map_err(|e| OperationError::JobFailed {
                job_id: job.id,
                reason: e.to_string(),
            })?;

        if job.status != JobStatus::Finished {
            return Err(job_failed(&job));
        }

        let uri = job.payload.clone().filter(|p| !p.is_empty());
        let mut media_package = workflow.media_package.clone();
        media_package.add(MediaPackageElement::new(kind, target_flavor, uri))?;
        Ok(OperationResult::continue_with(media_package)
            .with_property(format!("{}.job_id", op.name), job.id.to_string())
            .with_jobs([job.id]))
    }
}

fn job_failed(job: &Job) -> OperationError {
    OperationError::JobFailed {
        job_id: job.id,
        reason: job
            .error_message
            .clone()
            .unwrap_or_else(|| "no description".to_string()),
    }
}

/// Comma-separated arguments, trimmed, empty entries dropped.
fn split_arguments(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_trims_arguments() {
        assert_eq!(
            split_arguments(" 1080p, h264 ,,aac "),
            vec!["1080p", "h264", "aac"]
        );
        assert!(split_arguments("").is_empty());
    }
}
