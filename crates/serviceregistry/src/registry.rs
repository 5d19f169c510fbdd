//! The service registry: who can run which job type, and how busy they are.
//!
//! Registrations and host capacities live in memory behind a single
//! [`RwLock`]; job counts are always read live from the [`JobStore`] so
//! placement never works from a cached load figure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use castflow_core::error::CoreError;
use castflow_core::event_types::{self, ENTITY_JOB, ENTITY_SERVICE};
use castflow_core::job::{self, Job, NewJob};
use castflow_core::load_balancing::{self, PlacementCandidate};
use castflow_core::registration::{
    HostLoad, HostRegistration, RegisterService, ServiceRegistration, ServiceStatistics,
};
use castflow_core::status::JobStatus;
use castflow_core::store::{JobFilter, JobStore};
use castflow_core::types::DbId;
use castflow_events::{DomainEvent, EventBus};
use chrono::Utc;
use tokio::sync::RwLock;
use validator::Validate;

/// How often `update_job` re-reads and retries after a version conflict.
const MAX_UPDATE_ATTEMPTS: usize = 3;

#[derive(Default)]
struct RegistryState {
    /// Kept in insertion order; placement ties resolve by position.
    registrations: Vec<ServiceRegistration>,
    hosts: BTreeMap<String, HostRegistration>,
}

impl RegistryState {
    fn position(&self, service_type: &str, host: &str, path: &str) -> Option<usize> {
        self.registrations
            .iter()
            .position(|r| r.matches(service_type, host, path))
    }
}

/// Directory of service registrations plus the job update path.
///
/// Shared via `Arc<ServiceRegistry>`. Every mutation of the registration
/// set takes the write lock, so add, remove and maintenance toggles on the
/// same key never interleave.
pub struct ServiceRegistry {
    jobs: Arc<dyn JobStore>,
    events: Arc<EventBus>,
    state: RwLock<RegistryState>,
}

impl ServiceRegistry {
    pub fn new(jobs: Arc<dyn JobStore>, events: Arc<EventBus>) -> Self {
        Self {
            jobs,
            events,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Service registrations
    // -----------------------------------------------------------------------

    /// Register a service endpoint, or refresh an existing one.
    ///
    /// Re-registering the same `(service_type, host, path)` keeps a single
    /// entry (and its place in the placement order), marks it online and
    /// clears maintenance unless the request asks for it.
    pub async fn register_service(
        &self,
        input: RegisterService,
    ) -> Result<ServiceRegistration, CoreError> {
        input.validate()?;
        let maintenance = input.maintenance.unwrap_or(false);

        let registration = {
            let mut state = self.state.write().await;
            match state.position(&input.service_type, &input.host, &input.path) {
                Some(idx) => {
                    let existing = &mut state.registrations[idx];
                    existing.online = true;
                    existing.maintenance = maintenance;
                    existing.job_producer = input.job_producer;
                    existing.clone()
                }
                None => {
                    let registration = ServiceRegistration {
                        service_type: input.service_type,
                        host: input.host,
                        path: input.path,
                        online: true,
                        maintenance,
                        job_producer: input.job_producer,
                        registered_at: Utc::now(),
                    };
                    state.registrations.push(registration.clone());
                    registration
                }
            }
        };

        tracing::info!(
            service_type = %registration.service_type,
            host = %registration.host,
            path = %registration.path,
            job_producer = registration.job_producer,
            maintenance = registration.maintenance,
            "Service registered",
        );
        self.publish_service(event_types::SERVICE_REGISTERED, &registration);
        Ok(registration)
    }

    /// Remove a registration. Returns whether it existed.
    ///
    /// Jobs already placed on the endpoint are left alone; the reaper
    /// deals with any that stop reporting.
    pub async fn unregister_service(&self, service_type: &str, host: &str, path: &str) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            state
                .position(service_type, host, path)
                .map(|idx| state.registrations.remove(idx))
        };

        match removed {
            Some(registration) => {
                tracing::info!(service_type, host, path, "Service unregistered");
                self.publish_service(event_types::SERVICE_UNREGISTERED, &registration);
                true
            }
            None => false,
        }
    }

    /// Toggle maintenance on every registration of `service_type` on `host`.
    pub async fn set_maintenance_status(
        &self,
        service_type: &str,
        host: &str,
        maintenance: bool,
    ) -> Result<(), CoreError> {
        let changed = self
            .mutate_matching(
                |r| r.service_type == service_type && r.host == host,
                |r| r.maintenance = maintenance,
            )
            .await;
        if changed.is_empty() {
            return Err(CoreError::not_found(
                "ServiceRegistration",
                format!("{service_type}@{host}"),
            ));
        }
        tracing::info!(service_type, host, maintenance, "Service maintenance changed");
        for registration in &changed {
            self.publish_service(event_types::SERVICE_MAINTENANCE, registration);
        }
        Ok(())
    }

    /// Mark every registration of `service_type` on `host` online or
    /// offline. Used by health checks.
    pub async fn set_online_status(
        &self,
        service_type: &str,
        host: &str,
        online: bool,
    ) -> Result<(), CoreError> {
        let changed = self
            .mutate_matching(
                |r| r.service_type == service_type && r.host == host,
                |r| r.online = online,
            )
            .await;
        if changed.is_empty() {
            return Err(CoreError::not_found(
                "ServiceRegistration",
                format!("{service_type}@{host}"),
            ));
        }
        tracing::info!(service_type, host, online, "Service online status changed");
        for registration in &changed {
            self.publish_service(event_types::SERVICE_ONLINE, registration);
        }
        Ok(())
    }

    /// Snapshot of every registration, in insertion order.
    pub async fn registrations(&self) -> Vec<ServiceRegistration> {
        self.state.read().await.registrations.clone()
    }

    /// Snapshot of the registrations for one service type.
    pub async fn registrations_for(&self, service_type: &str) -> Vec<ServiceRegistration> {
        self.filtered(|r| r.service_type == service_type).await
    }

    /// Snapshot of the registrations on one host.
    pub async fn registrations_by_host(&self, host: &str) -> Vec<ServiceRegistration> {
        self.filtered(|r| r.host == host).await
    }

    /// The first registration of `service_type` on `host`, if any.
    pub async fn registration(
        &self,
        service_type: &str,
        host: &str,
    ) -> Option<ServiceRegistration> {
        self.state
            .read()
            .await
            .registrations
            .iter()
            .find(|r| r.service_type == service_type && r.host == host)
            .cloned()
    }

    /// Registrations of `service_type` that may receive a job now, best
    /// placement first.
    ///
    /// Eligible means online, not in maintenance, accepting jobs, and on a
    /// host below its registered capacity.
    pub async fn registrations_by_load(
        &self,
        service_type: &str,
    ) -> Result<Vec<ServiceRegistration>, CoreError> {
        let (eligible, hosts) = {
            let state = self.state.read().await;
            let eligible: Vec<ServiceRegistration> = state
                .registrations
                .iter()
                .filter(|r| r.service_type == service_type && r.accepts_jobs())
                .cloned()
                .collect();
            (eligible, state.hosts.clone())
        };

        let mut candidates = Vec::with_capacity(eligible.len());
        for registration in eligible {
            if let Some(host) = hosts.get(&registration.host) {
                let active = self.active_jobs_on_host(&registration.host).await?;
                if !load_balancing::has_capacity(active, Some(host.max_concurrent_jobs)) {
                    tracing::debug!(host = %registration.host, active, "Host at capacity");
                    continue;
                }
            }
            let running = self
                .count_jobs_on_host(service_type, JobStatus::Running, &registration.host)
                .await?;
            let queued = self
                .count_jobs_on_host(service_type, JobStatus::Queued, &registration.host)
                .await?;
            candidates.push(PlacementCandidate {
                registration,
                running,
                queued,
            });
        }

        Ok(load_balancing::rank_candidates(candidates)
            .into_iter()
            .map(|c| c.registration)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Hosts
    // -----------------------------------------------------------------------

    /// Register a host with the number of jobs it accepts concurrently.
    pub async fn register_host(
        &self,
        host: &str,
        max_concurrent_jobs: u32,
    ) -> Result<HostRegistration, CoreError> {
        if host.trim().is_empty() {
            return Err(CoreError::Validation("Host must not be empty".to_string()));
        }
        let registration = HostRegistration {
            host: host.to_string(),
            max_concurrent_jobs,
            registered_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .hosts
            .insert(host.to_string(), registration.clone());
        tracing::info!(host, max_concurrent_jobs, "Host registered");
        Ok(registration)
    }

    /// Remove a host and every service registration on it.
    pub async fn unregister_host(&self, host: &str) -> bool {
        let (host_removed, services) = {
            let mut state = self.state.write().await;
            let host_removed = state.hosts.remove(host).is_some();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.registrations)
                .into_iter()
                .partition(|r| r.host == host);
            state.registrations = kept;
            (host_removed, gone)
        };

        for registration in &services {
            self.publish_service(event_types::SERVICE_UNREGISTERED, registration);
        }
        let removed = host_removed || !services.is_empty();
        if removed {
            tracing::info!(host, services = services.len(), "Host unregistered");
        }
        removed
    }

    /// Toggle maintenance on every registration of a host.
    pub async fn set_host_maintenance(&self, host: &str, maintenance: bool) -> Result<(), CoreError> {
        let changed = self
            .mutate_matching(|r| r.host == host, |r| r.maintenance = maintenance)
            .await;
        if changed.is_empty() {
            return Err(CoreError::not_found("Host", host));
        }
        tracing::info!(host, maintenance, "Host maintenance changed");
        for registration in &changed {
            self.publish_service(event_types::SERVICE_MAINTENANCE, registration);
        }
        Ok(())
    }

    pub async fn hosts(&self) -> Vec<HostRegistration> {
        self.state.read().await.hosts.values().cloned().collect()
    }

    /// Active jobs per known host against its capacity, sorted by host.
    pub async fn load(&self) -> Result<Vec<HostLoad>, CoreError> {
        let (hosts, capacities) = {
            let state = self.state.read().await;
            let mut hosts: BTreeSet<String> =
                state.registrations.iter().map(|r| r.host.clone()).collect();
            hosts.extend(state.hosts.keys().cloned());
            let capacities: BTreeMap<String, u32> = state
                .hosts
                .iter()
                .map(|(h, r)| (h.clone(), r.max_concurrent_jobs))
                .collect();
            (hosts, capacities)
        };

        let mut load = Vec::with_capacity(hosts.len());
        for host in hosts {
            let active_jobs = self.active_jobs_on_host(&host).await?;
            load.push(HostLoad {
                max_concurrent_jobs: capacities.get(&host).copied(),
                host,
                active_jobs,
            });
        }
        Ok(load)
    }

    // -----------------------------------------------------------------------
    // Counts and statistics
    // -----------------------------------------------------------------------

    pub async fn count_jobs(&self, service_type: &str, status: JobStatus) -> Result<i64, CoreError> {
        self.jobs
            .count_jobs(&JobFilter::default().with_type(service_type).with_status(status))
            .await
    }

    pub async fn count_jobs_on_host(
        &self,
        service_type: &str,
        status: JobStatus,
        host: &str,
    ) -> Result<i64, CoreError> {
        self.jobs
            .count_jobs(
                &JobFilter::default()
                    .with_type(service_type)
                    .with_status(status)
                    .with_host(host),
            )
            .await
    }

    /// Per-registration job counts and mean timings, sorted by service
    /// type then host.
    pub async fn statistics(&self) -> Result<Vec<ServiceStatistics>, CoreError> {
        let mut registrations = self.registrations().await;
        registrations.sort_by(|a, b| {
            (&a.service_type, &a.host, &a.path).cmp(&(&b.service_type, &b.host, &b.path))
        });

        let mut stats = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let jobs = self
                .jobs
                .list_jobs(
                    &JobFilter::default()
                        .with_type(&registration.service_type)
                        .with_host(&registration.host),
                )
                .await?;

            let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count() as i64;
            let queue_times: Vec<i64> = jobs.iter().filter_map(|j| j.queue_time_ms).collect();
            let run_times: Vec<i64> = jobs
                .iter()
                .filter(|j| j.status == JobStatus::Finished)
                .filter_map(|j| j.run_time_ms)
                .collect();

            stats.push(ServiceStatistics {
                queued: count(JobStatus::Queued),
                running: count(JobStatus::Running),
                finished: count(JobStatus::Finished),
                failed: count(JobStatus::Failed),
                mean_queue_time_ms: load_balancing::mean(&queue_times),
                mean_run_time_ms: load_balancing::mean(&run_times),
                registration,
            });
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Create a job record in `QUEUED`.
    pub async fn create_job(&self, input: NewJob) -> Result<Job, CoreError> {
        let job = self.jobs.insert_job(input).await?;
        tracing::debug!(job_id = job.id, job_type = %job.job_type, host = ?job.host, "Job created");
        self.publish_job(event_types::JOB_CREATED, &job);
        Ok(job)
    }

    pub async fn get_job(&self, id: DbId) -> Result<Job, CoreError> {
        self.jobs
            .find_job(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Job", id))
    }

    /// Persist a status, payload or host change.
    ///
    /// The transition is validated against the stored record, timestamps
    /// are stamped here, and the write is version-checked. A conflicting
    /// concurrent write is retried against the fresh record, so a stale
    /// caller cannot resurrect a job another writer already finished.
    pub async fn update_job(&self, requested: &Job) -> Result<Job, CoreError> {
        let mut last_conflict = None;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.get_job(requested.id).await?;
            let next = job::prepare_update(&current, requested, Utc::now())?;
            match self.jobs.update_job(&next).await {
                Ok(stored) => {
                    self.announce_update(&current, &stored);
                    return Ok(stored);
                }
                Err(CoreError::Conflict(msg)) => last_conflict = Some(msg),
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Conflict(last_conflict.unwrap_or_default()))
    }

    /// Apply `requested` on top of `current` with a single version-checked
    /// write.
    ///
    /// Unlike [`update_job`](Self::update_job) this never re-reads: if the
    /// job changed since `current` was loaded the call fails with
    /// [`CoreError::Conflict`].
    pub async fn update_job_from(&self, current: &Job, requested: &Job) -> Result<Job, CoreError> {
        let next = job::prepare_update(current, requested, Utc::now())?;
        let stored = self.jobs.update_job(&next).await?;
        self.announce_update(current, &stored);
        Ok(stored)
    }

    /// Move a delivered job from `QUEUED` to `RUNNING`.
    ///
    /// Only the first attempt wins: a job that already left `QUEUED`, or
    /// was re-targeted away from the host it was delivered to, is rejected
    /// with [`CoreError::IllegalState`]. Two racing starts of the same
    /// snapshot resolve through the version check, the loser getting
    /// [`CoreError::Conflict`].
    pub async fn start_job(&self, delivered: &Job) -> Result<Job, CoreError> {
        let current = self.get_job(delivered.id).await?;
        if current.status != JobStatus::Queued {
            return Err(CoreError::IllegalState(format!(
                "Job {} is {} and cannot be started again",
                current.id, current.status
            )));
        }
        if current.host != delivered.host {
            return Err(CoreError::IllegalState(format!(
                "Job {} was moved to {} and cannot start on {}",
                current.id,
                current.host.as_deref().unwrap_or("no host"),
                delivered.host.as_deref().unwrap_or("no host"),
            )));
        }
        self.update_job_from(&current, &current.with_status(JobStatus::Running))
            .await
    }

    /// Refresh the liveness timestamp of a running job.
    pub async fn touch_job(&self, id: DbId) -> Result<Job, CoreError> {
        let current = self.get_job(id).await?;
        self.update_job(&current.with_status(JobStatus::Running)).await
    }

    /// Jobs of a service type in a status, ordered by id.
    pub async fn jobs(&self, service_type: &str, status: JobStatus) -> Result<Vec<Job>, CoreError> {
        self.jobs
            .list_jobs(&JobFilter::default().with_type(service_type).with_status(status))
            .await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        self.jobs.list_jobs(filter).await
    }

    pub(crate) async fn delete_jobs(&self, ids: &[DbId]) -> Result<u64, CoreError> {
        self.jobs.delete_jobs(ids).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn active_jobs_on_host(&self, host: &str) -> Result<i64, CoreError> {
        let queued = self
            .jobs
            .count_jobs(&JobFilter::default().with_host(host).with_status(JobStatus::Queued))
            .await?;
        let running = self
            .jobs
            .count_jobs(&JobFilter::default().with_host(host).with_status(JobStatus::Running))
            .await?;
        Ok(queued + running)
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<ServiceRegistration>
    where
        F: Fn(&ServiceRegistration) -> bool,
    {
        self.state
            .read()
            .await
            .registrations
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    async fn mutate_matching<P, M>(&self, predicate: P, mutate: M) -> Vec<ServiceRegistration>
    where
        P: Fn(&ServiceRegistration) -> bool,
        M: Fn(&mut ServiceRegistration),
    {
        let mut state = self.state.write().await;
        state
            .registrations
            .iter_mut()
            .filter(|r| predicate(r))
            .map(|r| {
                mutate(r);
                r.clone()
            })
            .collect()
    }

    fn announce_update(&self, before: &Job, after: &Job) {
        let event_type = match (before.status, after.status) {
            (JobStatus::Queued, JobStatus::Queued) if before.host != after.host => {
                event_types::JOB_REASSIGNED
            }
            (JobStatus::Queued, JobStatus::Running) => event_types::JOB_RUNNING,
            (_, JobStatus::Finished) => event_types::JOB_FINISHED,
            (_, JobStatus::Failed) => event_types::JOB_FAILED,
            _ => return,
        };
        tracing::debug!(
            job_id = after.id,
            from = %before.status,
            to = %after.status,
            host = ?after.host,
            "Job updated",
        );
        self.publish_job(event_type, after);
    }

    pub(crate) fn publish_job(&self, event_type: &str, job: &Job) {
        let mut event = DomainEvent::new(event_type)
            .with_source(ENTITY_JOB, job.id)
            .with_payload(serde_json::json!({
                "job_type": job.job_type,
                "operation": job.operation,
                "status": job.status,
            }));
        if let Some(host) = &job.host {
            event = event.with_host(host.clone());
        }
        self.events.publish(event);
    }

    fn publish_service(&self, event_type: &str, registration: &ServiceRegistration) {
        self.events.publish(
            DomainEvent::new(event_type)
                .with_host(registration.host.clone())
                .with_payload(serde_json::json!({
                    "entity": ENTITY_SERVICE,
                    "service_type": registration.service_type,
                    "path": registration.path,
                    "online": registration.online,
                    "maintenance": registration.maintenance,
                })),
        );
    }
}
