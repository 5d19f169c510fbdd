//! Background recovery for jobs whose producer went quiet, plus retention
//! of completed jobs.
//!
//! Reaping is a recovery action on the job record only; the producer is
//! never contacted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castflow_core::error::CoreError;
use castflow_core::event_types;
use castflow_core::status::JobStatus;
use castflow_core::store::JobFilter;
use castflow_core::types::{DbId, Timestamp};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::registry::ServiceRegistry;

/// Default liveness window for `RUNNING` jobs.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(300);

/// Default interval between reaper cycles.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Description stored on jobs failed by the reaper.
pub const REAPED_MESSAGE: &str = "No status update within the liveness window";

/// Jobs that must survive retention because something still refers to
/// them.
#[async_trait]
pub trait RetentionGuard: Send + Sync {
    async fn referenced_job_ids(&self) -> Result<HashSet<DbId>, CoreError>;
}

/// What one reaper cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Jobs moved from `RUNNING` to `FAILED`.
    pub reaped: Vec<DbId>,
    /// Completed jobs deleted by retention.
    pub purged: u64,
}

/// Periodically fails stale `RUNNING` jobs and purges old completed ones.
pub struct JobReaper {
    registry: Arc<ServiceRegistry>,
    liveness_window: Duration,
    interval: Duration,
    retention: Option<Duration>,
    guard: Option<Arc<dyn RetentionGuard>>,
}

impl JobReaper {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            interval: DEFAULT_REAPER_INTERVAL,
            retention: None,
            guard: None,
        }
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Delete completed jobs older than `retention`, except those the
    /// guard reports as referenced.
    pub fn with_retention(mut self, retention: Duration, guard: Arc<dyn RetentionGuard>) -> Self {
        self.retention = Some(retention);
        self.guard = Some(guard);
        self
    }

    /// Run the reaper loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            liveness_window_secs = self.liveness_window.as_secs(),
            retention_secs = self.retention.map(|r| r.as_secs()),
            "Job reaper started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(report) if report.reaped.is_empty() && report.purged == 0 => {
                            tracing::debug!("Reaper cycle found nothing to do");
                        }
                        Ok(report) => {
                            tracing::info!(
                                reaped = report.reaped.len(),
                                purged = report.purged,
                                "Reaper cycle complete",
                            );
                        }
                        Err(e) => tracing::error!(error = %e, "Reaper cycle failed"),
                    }
                }
            }
        }
    }

    /// One reaper cycle.
    pub async fn reap_once(&self) -> Result<ReapReport, CoreError> {
        let mut report = ReapReport {
            reaped: self.reap_stale().await?,
            purged: 0,
        };
        if let (Some(retention), Some(guard)) = (self.retention, &self.guard) {
            report.purged = self.purge(retention, guard.as_ref()).await?;
        }
        Ok(report)
    }

    async fn reap_stale(&self) -> Result<Vec<DbId>, CoreError> {
        let cutoff = cutoff(self.liveness_window);
        let stale = self
            .registry
            .list_jobs(
                &JobFilter::default()
                    .with_status(JobStatus::Running)
                    .updated_before(cutoff),
            )
            .await?;

        let mut reaped = Vec::new();
        for job in stale {
            match self
                .registry
                .update_job_from(&job, &job.failed(REAPED_MESSAGE))
                .await
            {
                Ok(failed) => {
                    tracing::warn!(
                        job_id = failed.id,
                        job_type = %failed.job_type,
                        host = ?failed.host,
                        "Reaped job with no recent status update",
                    );
                    self.registry.publish_job(event_types::JOB_REAPED, &failed);
                    reaped.push(failed.id);
                }
                // The producer reported in (or finished) since the listing.
                Err(CoreError::IllegalState(_)) | Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    async fn purge(&self, retention: Duration, guard: &dyn RetentionGuard) -> Result<u64, CoreError> {
        let cutoff = cutoff(retention);
        let referenced = guard.referenced_job_ids().await?;

        let mut expired = Vec::new();
        for status in [JobStatus::Finished, JobStatus::Failed] {
            let jobs = self
                .registry
                .list_jobs(
                    &JobFilter::default()
                        .with_status(status)
                        .completed_before(cutoff),
                )
                .await?;
            expired.extend(
                jobs.into_iter()
                    .map(|j| j.id)
                    .filter(|id| !referenced.contains(id)),
            );
        }

        if expired.is_empty() {
            return Ok(0);
        }
        self.registry.delete_jobs(&expired).await
    }
}

/// `now - window`, clamped to the earliest representable time.
fn cutoff(window: Duration) -> Timestamp {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
