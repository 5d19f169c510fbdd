//! The worker-side job contract and a handler-map implementation of it.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castflow_core::error::CoreError;
use castflow_core::job::Job;
use castflow_core::status::JobStatus;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;

use crate::registry::ServiceRegistry;

/// Default interval between liveness touches while an operation runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Why a job operation failed. Always ends up as the job's
/// `error_message`, never as a transport fault.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// One named operation a producer can run.
///
/// Returns the job's serialized payload on success.
#[async_trait]
pub trait JobOperation: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<String, JobError>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> JobOperation for FnOperation<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, JobError>> + Send,
{
    async fn execute(&self, job: &Job) -> Result<String, JobError> {
        (self.0)(job.clone()).await
    }
}

/// Wrap an async closure as a [`JobOperation`].
pub fn operation_fn<F, Fut>(f: F) -> Arc<dyn JobOperation>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, JobError>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

/// Capability implemented by every service that accepts asynchronous jobs.
///
/// `start_job` must move the job to `RUNNING` before doing substantive
/// work, and every exit path must leave it `FINISHED` or `FAILED`.
/// The operation name and arguments travel on the job itself.
#[async_trait]
pub trait JobProducer: Send + Sync {
    /// The job type this producer serves.
    fn job_type(&self) -> &str;

    fn registry(&self) -> &ServiceRegistry;

    /// Accept a dispatched job. Execution may continue after this returns.
    ///
    /// A job that is no longer `QUEUED` on this host must be refused.
    async fn start_job(&self, job: Job) -> Result<(), CoreError>;

    async fn count_jobs(&self, status: JobStatus) -> Result<i64, CoreError> {
        self.registry().count_jobs(self.job_type(), status).await
    }

    async fn count_jobs_on_host(&self, status: JobStatus, host: &str) -> Result<i64, CoreError> {
        self.registry()
            .count_jobs_on_host(self.job_type(), status, host)
            .await
    }

    /// Stop accepting work and wait for accepted jobs to reach a terminal
    /// status.
    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// MappedJobProducer
// ---------------------------------------------------------------------------

/// A producer that dispatches on the job's operation name through a map of
/// registered [`JobOperation`]s.
///
/// Each accepted job runs on its own task. Panics and unknown operations
/// fail the job; they never escape the task.
pub struct MappedJobProducer {
    job_type: String,
    registry: Arc<ServiceRegistry>,
    operations: HashMap<String, Arc<dyn JobOperation>>,
    heartbeat: Duration,
    tracker: TaskTracker,
}

impl MappedJobProducer {
    pub fn new(job_type: impl Into<String>, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            job_type: job_type.into(),
            registry,
            operations: HashMap::new(),
            heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        operation: Arc<dyn JobOperation>,
    ) -> Self {
        self.operations.insert(name.into(), operation);
        self
    }

    /// Liveness touch interval. Keep it well inside the reaper's window.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl JobProducer for MappedJobProducer {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    async fn start_job(&self, job: Job) -> Result<(), CoreError> {
        if job.job_type != self.job_type {
            return Err(CoreError::IllegalState(format!(
                "Producer for '{}' cannot run job {} of type '{}'",
                self.job_type, job.id, job.job_type
            )));
        }
        if self.tracker.is_closed() {
            return Err(CoreError::IllegalState(format!(
                "Producer for '{}' is shutting down",
                self.job_type
            )));
        }

        let running = self.registry.start_job(&job).await?;
        tracing::info!(
            job_id = running.id,
            job_type = %running.job_type,
            operation = %running.operation,
            "Job started",
        );

        let operation = self.operations.get(&running.operation).cloned();
        let registry = Arc::clone(&self.registry);
        let heartbeat = self.heartbeat;
        self.tracker
            .spawn(async move { run_job(registry, operation, running, heartbeat).await });
        Ok(())
    }

    async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Drive one started job to a terminal status.
async fn run_job(
    registry: Arc<ServiceRegistry>,
    operation: Option<Arc<dyn JobOperation>>,
    running: Job,
    heartbeat: Duration,
) {
    let job_id = running.id;
    let outcome = match operation {
        Some(operation) => execute(&registry, operation.as_ref(), &running, heartbeat).await,
        None => Err(JobError::UnknownOperation(running.operation.clone())),
    };

    let terminal = match outcome {
        Ok(payload) => running.finished(payload),
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Job operation failed");
            running.failed(e.to_string())
        }
    };
    match registry.update_job(&terminal).await {
        Ok(done) => tracing::info!(
            job_id,
            status = %done.status,
            run_time_ms = ?done.run_time_ms,
            "Job completed",
        ),
        Err(e) => tracing::error!(job_id, error = %e, "Failed to record job outcome"),
    }
}

/// Run the operation, touching the job on every heartbeat tick.
async fn execute(
    registry: &ServiceRegistry,
    operation: &dyn JobOperation,
    job: &Job,
    heartbeat: Duration,
) -> Result<String, JobError> {
    let work = AssertUnwindSafe(operation.execute(job)).catch_unwind();
    tokio::pin!(work);

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut work => {
                return match result {
                    Ok(result) => result,
                    Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
                };
            }
            _ = ticker.tick() => {
                if let Err(e) = registry.touch_job(job.id).await {
                    tracing::warn!(job_id = job.id, error = %e, "Job heartbeat failed");
                }
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_from_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn job_error_descriptions() {
        assert_eq!(
            JobError::UnknownOperation("mux".to_string()).to_string(),
            "Unknown operation 'mux'"
        );
        assert_eq!(JobError::Failed("disk full".to_string()).to_string(), "disk full");
    }
}
