//! The job entity and the rules for moving it through its lifecycle.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::JobStatus;
use crate::types::{DbId, Timestamp};

/// One dispatched, asynchronously executed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: DbId,
    /// Incremented by the store on every successful update.
    pub version: i32,
    /// Capability required to run the job, e.g. `"encode"`.
    pub job_type: String,
    /// Operation name the producer dispatches on.
    pub operation: String,
    pub arguments: Vec<String>,
    /// Base address of the host executing the job.
    pub host: Option<String>,
    pub status: JobStatus,
    /// Serialized result. Present only once `FINISHED`.
    pub payload: Option<String>,
    /// Failure description. Present only once `FAILED`.
    pub error_message: Option<String>,
    pub date_created: Timestamp,
    pub date_started: Option<Timestamp>,
    pub date_completed: Option<Timestamp>,
    /// Last status write, used by the reaper's liveness check.
    pub date_updated: Timestamp,
    /// `date_started - date_created`, cached when the job starts.
    pub queue_time_ms: Option<i64>,
    /// `date_completed - date_started`, cached when the job completes.
    pub run_time_ms: Option<i64>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy of this job with a new status and everything else untouched.
    ///
    /// Pass the result to the registry's `update_job`, which validates the
    /// transition and stamps the timestamps.
    pub fn with_status(&self, status: JobStatus) -> Job {
        Job {
            status,
            ..self.clone()
        }
    }

    /// Copy of this job marked `FINISHED` with `payload`.
    pub fn finished(&self, payload: impl Into<String>) -> Job {
        Job {
            status: JobStatus::Finished,
            payload: Some(payload.into()),
            ..self.clone()
        }
    }

    /// Copy of this job marked `FAILED` with a description.
    pub fn failed(&self, description: impl Into<String>) -> Job {
        Job {
            status: JobStatus::Failed,
            payload: None,
            error_message: Some(description.into()),
            ..self.clone()
        }
    }
}

/// DTO for creating a job record in `QUEUED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub host: Option<String>,
}

impl NewJob {
    /// Materialize the record a store inserts for this DTO.
    pub fn into_job(self, id: DbId, now: Timestamp) -> Job {
        Job {
            id,
            version: 0,
            job_type: self.job_type,
            operation: self.operation,
            arguments: self.arguments,
            host: self.host,
            status: JobStatus::Queued,
            payload: None,
            error_message: None,
            date_created: now,
            date_started: None,
            date_completed: None,
            date_updated: now,
            queue_time_ms: None,
            run_time_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Merge a requested update into the stored job.
///
/// Validates the status transition and the payload invariant, keeps the
/// immutable fields from `current`, and stamps `date_started`,
/// `date_completed`, `date_updated` and the cached queue/run times.
/// The host may only change while the job is still queued.
pub fn prepare_update(current: &Job, requested: &Job, now: Timestamp) -> Result<Job, CoreError> {
    let to = requested.status;
    current.status.validate_transition(to)?;

    if to != JobStatus::Finished && requested.payload.is_some() {
        return Err(CoreError::IllegalState(format!(
            "Job {} may only carry a payload once FINISHED (requested {to})",
            current.id
        )));
    }

    let mut next = current.clone();
    next.status = to;
    next.date_updated = now;

    if current.status == JobStatus::Queued {
        next.host = requested.host.clone();
    }

    match to {
        JobStatus::Queued => {}
        JobStatus::Running => {
            if current.status == JobStatus::Queued {
                let started = now.max(current.date_created);
                next.date_started = Some(started);
                next.queue_time_ms = Some(millis_between(current.date_created, started));
            }
        }
        JobStatus::Finished => {
            next.payload = Some(requested.payload.clone().unwrap_or_default());
            next.error_message = None;
            complete(&mut next, now);
        }
        JobStatus::Failed => {
            next.error_message = requested.error_message.clone();
            complete(&mut next, now);
        }
    }

    Ok(next)
}

fn complete(job: &mut Job, now: Timestamp) {
    let completed = match job.date_started {
        Some(started) => now.max(started),
        None => now,
    };
    job.date_completed = Some(completed);
    job.run_time_ms = job.date_started.map(|started| millis_between(started, completed));
}

fn millis_between(from: Timestamp, to: Timestamp) -> i64 {
    (to - from).num_milliseconds().max(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    fn queued_job() -> Job {
        NewJob {
            job_type: "encode".to_string(),
            operation: "transcode".to_string(),
            arguments: vec!["a".to_string()],
            host: Some("http://host-a".to_string()),
        }
        .into_job(1, Utc::now())
    }

    #[test]
    fn new_job_is_queued_without_payload() {
        let job = queued_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.payload.is_none());
        assert!(job.date_started.is_none());
    }

    #[test]
    fn running_stamps_start_and_queue_time() {
        let job = queued_job();
        let now = job.date_created + Duration::milliseconds(250);
        let running = prepare_update(&job, &job.with_status(JobStatus::Running), now).unwrap();

        assert_eq!(running.date_started, Some(now));
        assert_eq!(running.queue_time_ms, Some(250));
        assert!(running.date_started.unwrap() >= running.date_created);
    }

    #[test]
    fn start_never_precedes_creation() {
        let job = queued_job();
        let skewed = job.date_created - Duration::seconds(5);
        let running = prepare_update(&job, &job.with_status(JobStatus::Running), skewed).unwrap();
        assert_eq!(running.date_started, Some(job.date_created));
        assert_eq!(running.queue_time_ms, Some(0));
    }

    #[test]
    fn finished_stamps_run_time_and_keeps_payload() {
        let job = queued_job();
        let t1 = job.date_created + Duration::milliseconds(100);
        let running = prepare_update(&job, &job.with_status(JobStatus::Running), t1).unwrap();
        let t2 = t1 + Duration::milliseconds(400);
        let done = prepare_update(&running, &running.finished("out.mp4"), t2).unwrap();

        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(done.payload.as_deref(), Some("out.mp4"));
        assert_eq!(done.run_time_ms, Some(400));
        assert_eq!(done.queue_time_ms, Some(100));
        assert_eq!(done.date_completed, Some(t2));
    }

    #[test]
    fn finished_without_payload_stores_empty_payload() {
        let job = queued_job();
        let running =
            prepare_update(&job, &job.with_status(JobStatus::Running), Utc::now()).unwrap();
        let done = prepare_update(
            &running,
            &running.with_status(JobStatus::Finished),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(done.payload.as_deref(), Some(""));
    }

    #[test]
    fn payload_rejected_before_finished() {
        let job = queued_job();
        let mut requested = job.with_status(JobStatus::Running);
        requested.payload = Some("early".to_string());
        assert_matches!(
            prepare_update(&job, &requested, Utc::now()),
            Err(CoreError::IllegalState(_))
        );
    }

    #[test]
    fn failing_a_queued_job_has_no_run_time() {
        let job = queued_job();
        let failed = prepare_update(&job, &job.failed("host unreachable"), Utc::now()).unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("host unreachable"));
        assert!(failed.date_completed.is_some());
        assert!(failed.run_time_ms.is_none());
        assert!(failed.payload.is_none());
    }

    #[test]
    fn terminal_jobs_reject_updates() {
        let job = queued_job();
        let failed = prepare_update(&job, &job.failed("boom"), Utc::now()).unwrap();
        assert_matches!(
            prepare_update(&failed, &failed.with_status(JobStatus::Running), Utc::now()),
            Err(CoreError::IllegalState(_))
        );
    }

    #[test]
    fn host_is_fixed_once_running() {
        let job = queued_job();
        let running =
            prepare_update(&job, &job.with_status(JobStatus::Running), Utc::now()).unwrap();
        let mut moved = running.with_status(JobStatus::Running);
        moved.host = Some("http://host-b".to_string());
        let touched = prepare_update(&running, &moved, Utc::now()).unwrap();
        assert_eq!(touched.host.as_deref(), Some("http://host-a"));
    }
}
