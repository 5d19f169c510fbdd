//! PgStore against a real database.
//!
//! Needs `DATABASE_URL`; run with `cargo test -p castflow-db -- --ignored`.

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use castflow_core::error::CoreError;
use castflow_core::job::NewJob;
use castflow_core::media_package::{ElementKind, MediaPackage, MediaPackageElement};
use castflow_core::status::{JobStatus, OperationState, WorkflowState};
use castflow_core::store::{JobFilter, JobStore, WorkflowFilter, WorkflowStore};
use castflow_core::workflow::{NewWorkflow, OperationDefinition, WorkflowDefinition};
use castflow_db::PgStore;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_job(job_type: &str, host: &str) -> NewJob {
    NewJob {
        job_type: job_type.to_string(),
        operation: "transcode".to_string(),
        arguments: vec!["in.mov".to_string(), "1080p".to_string()],
        host: Some(host.to_string()),
    }
}

fn new_workflow() -> NewWorkflow {
    let definition = WorkflowDefinition::new(
        "publish",
        vec![
            OperationDefinition::new("encode").with_config("job-type", "encode"),
            OperationDefinition::new("approve"),
        ],
    );
    let mut mp = MediaPackage::new().with_title("Lecture 7");
    mp.add(MediaPackageElement::new(
        ElementKind::Track,
        "presenter/source",
        Some("s3://raw/7.mov".to_string()),
    ))
    .unwrap();
    NewWorkflow::from_definition(
        &definition,
        mp,
        BTreeMap::from([("quality".to_string(), "720p".to_string())]),
    )
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn status_lookups_are_seeded(pool: PgPool) {
    castflow_db::health_check(&pool).await.unwrap();

    for (table, expected) in [("job_statuses", 4_i64), ("workflow_states", 7)] {
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("{table} query failed: {e}"));
        assert_eq!(count.0, expected, "{table}");
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn job_insert_and_find(pool: PgPool) {
    let store = PgStore::new(pool);

    let job = store.insert_job(new_job("encode", "http://a:8080")).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.version, 0);
    assert_eq!(job.arguments, vec!["in.mov", "1080p"]);

    let found = store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(found, job);
    assert!(store.find_job(job.id + 1000).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn job_update_is_optimistic(pool: PgPool) {
    let store = PgStore::new(pool);
    let job = store.insert_job(new_job("encode", "http://a:8080")).await.unwrap();

    let mut running = job.with_status(JobStatus::Running);
    running.date_started = Some(chrono::Utc::now());
    let stored = store.update_job(&running).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.status, JobStatus::Running);

    // The original copy is now stale.
    assert_matches!(
        store.update_job(&job.failed("late")).await,
        Err(CoreError::Conflict(_))
    );

    let mut gone = stored.clone();
    gone.id += 1000;
    assert_matches!(
        store.update_job(&gone).await,
        Err(CoreError::NotFound { entity: "Job", .. })
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn job_filters_and_delete(pool: PgPool) {
    let store = PgStore::new(pool);
    let a = store.insert_job(new_job("encode", "http://a:8080")).await.unwrap();
    let b = store.insert_job(new_job("encode", "http://b:8080")).await.unwrap();
    let c = store.insert_job(new_job("inspect", "http://a:8080")).await.unwrap();

    let mut finished = b.finished("out.mp4");
    finished.date_completed = Some(chrono::Utc::now());
    store.update_job(&finished).await.unwrap();

    let encode = JobFilter::default().with_type("encode");
    assert_eq!(store.count_jobs(&encode).await.unwrap(), 2);
    let on_a: Vec<_> = store
        .list_jobs(&JobFilter::default().with_host("http://a:8080"))
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(on_a, vec![a.id, c.id]);
    assert_eq!(
        store
            .count_jobs(&encode.clone().with_status(JobStatus::Finished))
            .await
            .unwrap(),
        1
    );

    let completed = JobFilter::default().completed_before(chrono::Utc::now());
    assert_eq!(store.list_jobs(&completed).await.unwrap()[0].id, b.id);

    assert_eq!(store.delete_jobs(&[a.id, b.id, a.id + 1000]).await.unwrap(), 2);
    assert_eq!(store.delete_jobs(&[]).await.unwrap(), 0);
    assert_eq!(store.count_jobs(&JobFilter::default()).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn workflow_round_trips_runtime_state(pool: PgPool) {
    let store = PgStore::new(pool);
    let mut wf = store.insert_workflow(new_workflow()).await.unwrap();
    assert_eq!(wf.state, WorkflowState::Instantiated);
    assert_eq!(wf.current_operation_name(), Some("encode"));

    wf.state = WorkflowState::Paused;
    wf.operations[0].state = OperationState::Succeeded;
    wf.operations[0].job_ids = vec![41, 42];
    wf.current_operation = 1;
    wf.operations[1].state = OperationState::Paused;
    wf.operations[1].hold_action_title = Some("Approve".to_string());
    wf.properties.insert("approve.comment".to_string(), "ok".to_string());
    wf.error_messages.push("encode: retried".to_string());
    store.update_workflow(&wf).await.unwrap();

    let loaded = store.find_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(loaded, wf);

    let paused_on_approve = WorkflowFilter::default()
        .with_state(WorkflowState::Paused)
        .with_current_operation("approve");
    assert_eq!(store.count_workflows(&paused_on_approve).await.unwrap(), 1);
    assert_eq!(
        store
            .count_workflows(&WorkflowFilter::default().with_current_operation("encode"))
            .await
            .unwrap(),
        0
    );

    // Operations replaced by an exception handler workflow persist too.
    let mut failing = loaded;
    failing.state = WorkflowState::Failing;
    let cleanup = failing.operations[0].clone();
    failing.splice_after(0, vec![cleanup]);
    store.update_workflow(&failing).await.unwrap();
    let loaded = store.find_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(loaded.discarded_operations.len(), 1);
    assert_eq!(loaded.discarded_operations[0].name, "approve");
    assert_eq!(loaded, failing);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn workflow_children_and_delete(pool: PgPool) {
    let store = PgStore::new(pool);
    let parent = store.insert_workflow(new_workflow()).await.unwrap();
    let mut child = new_workflow();
    child.parent_id = Some(parent.id);
    let child = store.insert_workflow(child).await.unwrap();

    let children = store
        .list_workflows(&WorkflowFilter::default().with_parent(parent.id))
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, child.id);

    assert!(store.delete_workflow(parent.id).await.unwrap());
    assert!(!store.delete_workflow(parent.id).await.unwrap());
    let orphan = store.find_workflow(child.id).await.unwrap().unwrap();
    assert_eq!(orphan.parent_id, None);

    let mut missing = orphan.clone();
    missing.id += 1000;
    assert_matches!(
        store.update_workflow(&missing).await,
        Err(CoreError::NotFound { .. })
    );
}
