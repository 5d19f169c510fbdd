//! Delivery of dispatched jobs to their producers.
//!
//! A transport only has to convey the job id, the operation name and the
//! argument list; producers report progress back through the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castflow_core::job::Job;
use castflow_core::registration::ServiceRegistration;
use castflow_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::producer::JobProducer;

/// Default timeout for a remote dispatch call.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Path suffix appended to a registration's `host + path` for remote
/// dispatch.
pub const DISPATCH_ENDPOINT: &str = "/dispatch";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Nothing is listening for this job type on this host.
    #[error("No producer for {service_type} on {host}")]
    NoProducer { service_type: String, host: String },

    /// The producer refused the job.
    #[error("Producer rejected job {job_id}: {reason}")]
    Rejected { job_id: DbId, reason: String },

    #[error("HTTP dispatch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote producer returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },
}

/// Wire form of a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: DbId,
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
}

impl From<&Job> for DispatchRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            operation: job.operation.clone(),
            arguments: job.arguments.clone(),
        }
    }
}

/// Hands a queued job to the producer behind a registration.
#[async_trait]
pub trait JobTransport: Send + Sync {
    async fn deliver(
        &self,
        registration: &ServiceRegistration,
        job: &Job,
    ) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// In-process transport keyed by `(service_type, host)`.
///
/// Jobs for endpoints without a local producer go to the fallback
/// transport when one is configured.
#[derive(Default)]
pub struct LocalTransport {
    producers: RwLock<HashMap<(String, String), Arc<dyn JobProducer>>>,
    fallback: Option<Arc<dyn JobTransport>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward jobs with no local producer to `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn JobTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Attach a producer for its job type on `host`, replacing any
    /// previous one.
    pub async fn attach(&self, host: impl Into<String>, producer: Arc<dyn JobProducer>) {
        let key = (producer.job_type().to_string(), host.into());
        tracing::debug!(service_type = %key.0, host = %key.1, "Local producer attached");
        self.producers.write().await.insert(key, producer);
    }

    pub async fn detach(&self, service_type: &str, host: &str) -> bool {
        self.producers
            .write()
            .await
            .remove(&(service_type.to_string(), host.to_string()))
            .is_some()
    }
}

#[async_trait]
impl JobTransport for LocalTransport {
    async fn deliver(
        &self,
        registration: &ServiceRegistration,
        job: &Job,
    ) -> Result<(), TransportError> {
        let producer = self
            .producers
            .read()
            .await
            .get(&(registration.service_type.clone(), registration.host.clone()))
            .cloned();

        match (producer, &self.fallback) {
            (Some(producer), _) => {
                producer
                    .start_job(job.clone())
                    .await
                    .map_err(|e| TransportError::Rejected {
                        job_id: job.id,
                        reason: e.to_string(),
                    })
            }
            (None, Some(fallback)) => fallback.deliver(registration, job).await,
            (None, None) => Err(TransportError::NoProducer {
                service_type: registration.service_type.clone(),
                host: registration.host.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// Delivers jobs to remote producers with a JSON `POST` to
/// `{host}{path}/dispatch`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn dispatch_url(registration: &ServiceRegistration) -> String {
        format!(
            "{}{}{DISPATCH_ENDPOINT}",
            registration.host.trim_end_matches('/'),
            registration.path
        )
    }
}

#[async_trait]
impl JobTransport for HttpTransport {
    async fn deliver(
        &self,
        registration: &ServiceRegistration,
        job: &Job,
    ) -> Result<(), TransportError> {
        let url = Self::dispatch_url(registration);
        let response = self
            .client
            .post(&url)
            .json(&DispatchRequest::from(job))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(job_id = job.id, url = %url, "Job delivered over HTTP");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::RemoteStatus {
            status: status.as_u16(),
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
