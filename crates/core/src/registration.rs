//! Service and host registrations, plus the aggregate views derived from
//! them.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::types::Timestamp;

/// One capability endpoint on one host.
///
/// At most one registration exists per `(service_type, host, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_type: String,
    pub host: String,
    pub path: String,
    /// Whether the endpoint currently accepts work.
    pub online: bool,
    /// Administrative exclusion from dispatch, independent of `online`.
    pub maintenance: bool,
    /// Whether the endpoint accepts asynchronous jobs.
    pub job_producer: bool,
    pub registered_at: Timestamp,
}

impl ServiceRegistration {
    /// Whether the dispatcher may place new jobs here.
    pub fn accepts_jobs(&self) -> bool {
        self.online && !self.maintenance && self.job_producer
    }

    pub fn matches(&self, service_type: &str, host: &str, path: &str) -> bool {
        self.service_type == service_type && self.host == host && self.path == path
    }
}

/// DTO for registering (or re-registering) a service endpoint.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterService {
    #[validate(length(min = 1, max = 255))]
    pub service_type: String,
    #[validate(length(min = 1, max = 2048))]
    pub host: String,
    #[validate(length(max = 2048))]
    pub path: String,
    pub job_producer: bool,
    /// Maintenance flag to apply. `None` clears it, which is what a host
    /// coming back from a restart wants.
    #[serde(default)]
    pub maintenance: Option<bool>,
}

impl RegisterService {
    pub fn new(
        service_type: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        job_producer: bool,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            host: host.into(),
            path: path.into(),
            job_producer,
            maintenance: None,
        }
    }

    /// Keep (or put) the registration in maintenance on registration.
    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = Some(maintenance);
        self
    }
}

/// A host and the number of jobs it is willing to run at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRegistration {
    pub host: String,
    pub max_concurrent_jobs: u32,
    pub registered_at: Timestamp,
}

/// Per-registration job counts and timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub registration: ServiceRegistration,
    pub queued: i64,
    pub running: i64,
    pub finished: i64,
    pub failed: i64,
    /// Mean `queue_time_ms` over jobs that have started.
    pub mean_queue_time_ms: Option<i64>,
    /// Mean `run_time_ms` over finished jobs.
    pub mean_run_time_ms: Option<i64>,
}

/// Active job count on a host against its advertised capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLoad {
    pub host: String,
    /// `QUEUED + RUNNING` across every job type.
    pub active_jobs: i64,
    /// `None` when the host never registered a capacity.
    pub max_concurrent_jobs: Option<u32>,
}

impl HostLoad {
    pub fn has_capacity(&self) -> bool {
        crate::load_balancing::has_capacity(self.active_jobs, self.max_concurrent_jobs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
