#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use castflow_core::job::Job;
use castflow_core::registration::RegisterService;
use castflow_core::status::JobStatus;
use castflow_core::store::MemoryStore;
use castflow_events::EventBus;
use castflow_serviceregistry::{JobBarrier, ServiceRegistry};

pub const HOST_A: &str = "http://host-a:8080";
pub const HOST_B: &str = "http://host-b:8080";
pub const HOST_C: &str = "http://host-c:8080";
pub const ENCODE: &str = "encode";

pub fn registry() -> Arc<ServiceRegistry> {
    Arc::new(ServiceRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(EventBus::default()),
    ))
}

pub fn encode_service(host: &str) -> RegisterService {
    RegisterService::new(ENCODE, host, "/encode", true)
}

pub fn barrier(registry: &Arc<ServiceRegistry>) -> JobBarrier {
    JobBarrier::new(Arc::clone(registry))
        .with_poll_interval(Duration::from_millis(20))
        .with_timeout(Duration::from_secs(5))
}

/// Move a queued job to `RUNNING` the way a producer would.
pub async fn start(registry: &ServiceRegistry, job: &Job) -> Job {
    registry
        .update_job(&job.with_status(JobStatus::Running))
        .await
        .expect("job should start")
}
