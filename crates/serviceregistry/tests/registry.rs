//! Registration bookkeeping, job counts and statistics.

mod common;

use assert_matches::assert_matches;
use castflow_core::error::CoreError;
use castflow_core::job::NewJob;
use castflow_core::registration::RegisterService;
use castflow_core::status::JobStatus;

use common::*;

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registrations_reflect_net_set() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry.register_service(encode_service(HOST_B)).await.unwrap();
    registry.register_service(encode_service(HOST_C)).await.unwrap();
    registry
        .register_service(RegisterService::new("inspect", HOST_A, "/inspect", true))
        .await
        .unwrap();

    assert!(registry.unregister_service(ENCODE, HOST_B, "/encode").await);
    assert!(!registry.unregister_service(ENCODE, HOST_B, "/encode").await);
    registry.register_service(encode_service(HOST_B)).await.unwrap();
    assert!(registry.unregister_service(ENCODE, HOST_A, "/encode").await);

    let hosts: Vec<String> = registry
        .registrations_for(ENCODE)
        .await
        .into_iter()
        .map(|r| r.host)
        .collect();
    assert_eq!(hosts, vec![HOST_C.to_string(), HOST_B.to_string()]);
    assert_eq!(registry.registrations().await.len(), 3);
}

#[tokio::test]
async fn reregistration_is_idempotent_and_clears_maintenance() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry.set_maintenance_status(ENCODE, HOST_A, true).await.unwrap();
    registry.set_online_status(ENCODE, HOST_A, false).await.unwrap();

    let again = registry.register_service(encode_service(HOST_A)).await.unwrap();

    assert!(again.online);
    assert!(!again.maintenance);
    assert_eq!(registry.registrations_for(ENCODE).await.len(), 1);
}

#[tokio::test]
async fn reregistration_can_keep_maintenance() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    let again = registry
        .register_service(encode_service(HOST_A).with_maintenance(true))
        .await
        .unwrap();
    assert!(again.online);
    assert!(again.maintenance);
}

#[tokio::test]
async fn maintenance_on_unknown_registration_is_not_found() {
    let registry = registry();
    assert_matches!(
        registry.set_maintenance_status(ENCODE, HOST_A, true).await,
        Err(CoreError::NotFound { entity: "ServiceRegistration", .. })
    );
}

#[tokio::test]
async fn invalid_registration_rejected() {
    let registry = registry();
    assert_matches!(
        registry
            .register_service(RegisterService::new("", HOST_A, "/", true))
            .await,
        Err(CoreError::Validation(_))
    );
    assert!(registry.registrations().await.is_empty());
}

#[tokio::test]
async fn lookup_by_host_and_type() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry
        .register_service(RegisterService::new("inspect", HOST_A, "/inspect", false))
        .await
        .unwrap();
    registry.register_service(encode_service(HOST_B)).await.unwrap();

    assert_eq!(registry.registrations_by_host(HOST_A).await.len(), 2);
    let inspect = registry.registration("inspect", HOST_A).await.unwrap();
    assert!(!inspect.job_producer);
    assert!(registry.registration("inspect", HOST_B).await.is_none());
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregister_host_removes_its_services() {
    let registry = registry();
    registry.register_host(HOST_A, 4).await.unwrap();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry.register_service(encode_service(HOST_B)).await.unwrap();

    assert!(registry.unregister_host(HOST_A).await);
    assert!(registry.hosts().await.is_empty());
    assert_eq!(registry.registrations().await.len(), 1);
    assert!(!registry.unregister_host(HOST_A).await);
}

#[tokio::test]
async fn host_maintenance_excludes_all_its_services() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry
        .register_service(RegisterService::new("inspect", HOST_A, "/inspect", true))
        .await
        .unwrap();

    registry.set_host_maintenance(HOST_A, true).await.unwrap();

    assert!(registry.registrations_by_load(ENCODE).await.unwrap().is_empty());
    assert!(registry.registrations_by_load("inspect").await.unwrap().is_empty());
    assert_matches!(
        registry.set_host_maintenance(HOST_C, true).await,
        Err(CoreError::NotFound { entity: "Host", .. })
    );
}

#[tokio::test]
async fn full_host_is_not_eligible() {
    let registry = registry();
    registry.register_host(HOST_A, 1).await.unwrap();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry.register_service(encode_service(HOST_B)).await.unwrap();

    registry
        .create_job(NewJob {
            job_type: "inspect".to_string(),
            operation: "probe".to_string(),
            arguments: vec![],
            host: Some(HOST_A.to_string()),
        })
        .await
        .unwrap();

    let eligible = registry.registrations_by_load(ENCODE).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].host, HOST_B);

    let load = registry.load().await.unwrap();
    let host_a = load.iter().find(|l| l.host == HOST_A).unwrap();
    assert_eq!(host_a.active_jobs, 1);
    assert!(!host_a.has_capacity());
}

// ---------------------------------------------------------------------------
// Jobs, counts and statistics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_not_found() {
    let registry = registry();
    assert_matches!(
        registry.get_job(42).await,
        Err(CoreError::NotFound { entity: "Job", .. })
    );
}

#[tokio::test]
async fn counts_are_live_per_host_and_status() {
    let registry = registry();
    registry.register_service(encode_service(HOST_A)).await.unwrap();

    let mut jobs = Vec::new();
    for host in [HOST_A, HOST_A, HOST_B] {
        jobs.push(
            registry
                .create_job(NewJob {
                    job_type: ENCODE.to_string(),
                    operation: "transcode".to_string(),
                    arguments: vec![],
                    host: Some(host.to_string()),
                })
                .await
                .unwrap(),
        );
    }
    start(&registry, &jobs[0]).await;

    assert_eq!(registry.count_jobs(ENCODE, JobStatus::Queued).await.unwrap(), 2);
    assert_eq!(
        registry
            .count_jobs_on_host(ENCODE, JobStatus::Running, HOST_A)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        registry
            .count_jobs_on_host(ENCODE, JobStatus::Queued, HOST_B)
            .await
            .unwrap(),
        1
    );
    assert_eq!(registry.jobs(ENCODE, JobStatus::Queued).await.unwrap().len(), 2);
}

#[tokio::test]
async fn terminal_jobs_never_change_again() {
    let registry = registry();
    let job = registry
        .create_job(NewJob {
            job_type: ENCODE.to_string(),
            operation: "transcode".to_string(),
            arguments: vec![],
            host: Some(HOST_A.to_string()),
        })
        .await
        .unwrap();
    let running = start(&registry, &job).await;
    let done = registry.update_job(&running.finished("out.mp4")).await.unwrap();
    assert_eq!(done.payload.as_deref(), Some("out.mp4"));

    assert_matches!(
        registry.update_job(&done.failed("late failure")).await,
        Err(CoreError::IllegalState(_))
    );
    let stored = registry.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Finished);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn statistics_sorted_with_means() {
    let registry = registry();
    registry.register_service(encode_service(HOST_B)).await.unwrap();
    registry.register_service(encode_service(HOST_A)).await.unwrap();
    registry
        .register_service(RegisterService::new("archive", HOST_B, "/archive", true))
        .await
        .unwrap();

    for _ in 0..2 {
        let job = registry
            .create_job(NewJob {
                job_type: ENCODE.to_string(),
                operation: "transcode".to_string(),
                arguments: vec![],
                host: Some(HOST_A.to_string()),
            })
            .await
            .unwrap();
        let running = start(&registry, &job).await;
        registry.update_job(&running.finished("ok")).await.unwrap();
    }
    let failed = registry
        .create_job(NewJob {
            job_type: ENCODE.to_string(),
            operation: "transcode".to_string(),
            arguments: vec![],
            host: Some(HOST_A.to_string()),
        })
        .await
        .unwrap();
    registry.update_job(&failed.failed("rejected")).await.unwrap();

    let stats = registry.statistics().await.unwrap();
    let keys: Vec<(&str, &str)> = stats
        .iter()
        .map(|s| (s.registration.service_type.as_str(), s.registration.host.as_str()))
        .collect();
    assert_eq!(keys, vec![("archive", HOST_B), (ENCODE, HOST_A), (ENCODE, HOST_B)]);

    let host_a = &stats[1];
    assert_eq!(host_a.finished, 2);
    assert_eq!(host_a.failed, 1);
    assert_eq!(host_a.queued, 0);
    assert!(host_a.mean_run_time_ms.is_some());
    assert!(host_a.mean_queue_time_ms.is_some());
    assert_eq!(stats[2].finished, 0);
    assert!(stats[2].mean_run_time_ms.is_none());
}
