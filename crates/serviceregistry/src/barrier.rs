//! Blocking until dispatched jobs reach a terminal status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use castflow_core::error::CoreError;
use castflow_core::event_types::ENTITY_JOB;
use castflow_core::job::Job;
use castflow_core::types::DbId;
use castflow_events::DomainEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::registry::ServiceRegistry;

/// Default interval between store polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Waits for a set of jobs to finish or fail.
///
/// Job events on the bus wake the barrier early; polling covers events
/// lost to a lagging receiver and jobs updated by another process.
#[derive(Clone)]
pub struct JobBarrier {
    registry: Arc<ServiceRegistry>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl JobBarrier {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up with [`CoreError::Timeout`] after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for one job.
    pub async fn wait_for_job(&self, job_id: DbId) -> Result<Job, CoreError> {
        let mut jobs = self.wait_for(&[job_id]).await?;
        jobs.pop()
            .ok_or_else(|| CoreError::not_found("Job", job_id))
    }

    /// Wait until every job in `job_ids` is terminal. Returns them in the
    /// order given.
    pub async fn wait_for(&self, job_ids: &[DbId]) -> Result<Vec<Job>, CoreError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait_inner(job_ids))
                .await
                .map_err(|_| {
                    CoreError::Timeout(format!(
                        "Jobs {job_ids:?} not terminal after {}ms",
                        timeout.as_millis()
                    ))
                })?,
            None => self.wait_inner(job_ids).await,
        }
    }

    async fn wait_inner(&self, job_ids: &[DbId]) -> Result<Vec<Job>, CoreError> {
        // Subscribe before the first check so no transition slips between.
        let mut rx = self.registry.events().subscribe();
        let mut bus_open = true;
        let mut done: BTreeMap<DbId, Job> = BTreeMap::new();

        loop {
            for id in job_ids {
                if done.contains_key(id) {
                    continue;
                }
                let job = self.registry.get_job(*id).await?;
                if job.is_terminal() {
                    done.insert(*id, job);
                }
            }
            if job_ids.iter().all(|id| done.contains_key(id)) {
                return Ok(job_ids.iter().filter_map(|id| done.get(id).cloned()).collect());
            }

            self.next_wake(&mut rx, &mut bus_open, job_ids).await;
        }
    }

    /// Return on a relevant job event, a lagged or closed bus, or after one
    /// poll interval, whichever comes first.
    async fn next_wake(
        &self,
        rx: &mut broadcast::Receiver<DomainEvent>,
        bus_open: &mut bool,
        job_ids: &[DbId],
    ) {
        let deadline = Instant::now() + self.poll_interval;
        if !*bus_open {
            tokio::time::sleep_until(deadline).await;
            return;
        }
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) if job_ids.iter().any(|id| event.is_about(ENTITY_JOB, *id)) => return,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => return,
                    Err(RecvError::Closed) => {
                        *bus_open = false;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => return,
            }
        }
    }
}
