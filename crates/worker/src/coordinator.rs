//! Owns the long-lived services of one castflow host.

use std::sync::Arc;
use std::time::Duration;

use castflow_core::error::CoreError;
use castflow_core::registration::RegisterService;
use castflow_core::store::{JobStore, MemoryStore, WorkflowStore};
use castflow_db::PgStore;
use castflow_events::EventBus;
use castflow_serviceregistry::{
    HttpTransport, JobBarrier, JobDispatcher, JobProducer, JobReaper, LocalTransport,
    RetentionGuard, ServiceRegistry,
};
use castflow_workflow::handlers::{DispatchJobHandler, HoldHandler};
use castflow_workflow::{HandlerRegistry, WorkflowService};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;

/// Operation name of the built-in [`DispatchJobHandler`].
pub const DISPATCH_JOB_OPERATION: &str = "dispatch-job";

/// Operation name of the built-in [`HoldHandler`].
pub const HOLD_OPERATION: &str = "hold";

/// How long `stop` waits for the reaper loop to exit.
const REAPER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistence backends for jobs and workflow instances.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub workflows: Arc<dyn WorkflowStore>,
}

impl Stores {
    /// Both stores in process memory.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            jobs: store.clone(),
            workflows: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            jobs: store.clone(),
            workflows: store,
        }
    }
}

/// A producer attached to this host and the path it was registered under.
struct Attached {
    path: String,
    producer: Arc<dyn JobProducer>,
}

/// The registry, dispatcher, workflow service and reaper of one host.
pub struct Coordinator {
    config: CoordinatorConfig,
    events: Arc<EventBus>,
    registry: Arc<ServiceRegistry>,
    transport: Arc<LocalTransport>,
    dispatcher: Arc<JobDispatcher>,
    workflows: Arc<WorkflowService>,
    attached: Mutex<Vec<Attached>>,
    cancel: CancellationToken,
    reaper_handle: JoinHandle<()>,
}

impl Coordinator {
    /// Start with only the built-in operation handlers.
    pub async fn start(config: CoordinatorConfig, stores: Stores) -> Result<Self, CoreError> {
        Self::start_with_handlers(config, stores, HandlerRegistry::new()).await
    }

    /// Start with additional operation handlers. The built-in
    /// `dispatch-job` and `hold` handlers are added unless `handlers`
    /// already claims those names.
    pub async fn start_with_handlers(
        config: CoordinatorConfig,
        stores: Stores,
        mut handlers: HandlerRegistry,
    ) -> Result<Self, CoreError> {
        let events = Arc::new(EventBus::default());
        let registry = Arc::new(ServiceRegistry::new(stores.jobs, Arc::clone(&events)));
        registry
            .register_host(&config.host_url, config.max_concurrent_jobs)
            .await?;

        let http = HttpTransport::new(config.dispatch_timeout)
            .map_err(|e| CoreError::Internal(format!("HTTP transport: {e}")))?;
        let transport = Arc::new(LocalTransport::new().with_fallback(Arc::new(http)));
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport) as _,
        ));

        if !handlers.contains(DISPATCH_JOB_OPERATION) {
            let barrier = JobBarrier::new(Arc::clone(&registry));
            handlers.register(
                DISPATCH_JOB_OPERATION,
                Arc::new(DispatchJobHandler::new(Arc::clone(&dispatcher), barrier)),
            )?;
        }
        if !handlers.contains(HOLD_OPERATION) {
            handlers.register(HOLD_OPERATION, Arc::new(HoldHandler::new()))?;
        }
        tracing::info!(operations = ?handlers.operations(), "Operation handlers registered");

        let workflows = Arc::new(
            WorkflowService::new(stores.workflows, Arc::clone(&events), handlers)
                .with_concurrency(config.workflow_concurrency),
        );

        let mut reaper = JobReaper::new(Arc::clone(&registry))
            .with_liveness_window(config.liveness_window)
            .with_interval(config.reaper_interval);
        if let Some(retention) = config.retention {
            let guard: Arc<dyn RetentionGuard> = workflows.clone();
            reaper = reaper.with_retention(retention, guard);
        }
        let cancel = CancellationToken::new();
        let reaper_cancel = cancel.clone();
        let reaper_handle = tokio::spawn(async move {
            reaper.run(reaper_cancel).await;
        });

        let recovered = workflows.recover().await?;
        tracing::info!(
            host = %config.host_url,
            recovered,
            "Coordinator started",
        );

        Ok(Self {
            config,
            events,
            registry,
            transport,
            dispatcher,
            workflows,
            attached: Mutex::new(Vec::new()),
            cancel,
            reaper_handle,
        })
    }

    /// Register `producer` as a service of this host at `path` and deliver
    /// its jobs in process.
    pub async fn attach_producer(
        &self,
        producer: Arc<dyn JobProducer>,
        path: &str,
    ) -> Result<(), CoreError> {
        let job_type = producer.job_type().to_string();
        self.transport
            .attach(self.config.host_url.clone(), Arc::clone(&producer))
            .await;
        self.registry
            .register_service(RegisterService::new(
                job_type,
                self.config.host_url.clone(),
                path,
                true,
            ))
            .await?;
        self.attached.lock().await.push(Attached {
            path: path.to_string(),
            producer,
        });
        Ok(())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn workflows(&self) -> &Arc<WorkflowService> {
        &self.workflows
    }

    /// Stop the reaper, withdraw this host's services, let accepted jobs
    /// finish, then wait for running workflow operations to drain.
    /// Unfinished instances stay `RUNNING` for the next `recover`.
    pub async fn stop(self) {
        tracing::info!("Coordinator stopping");
        self.cancel.cancel();
        if tokio::time::timeout(REAPER_SHUTDOWN_TIMEOUT, self.reaper_handle)
            .await
            .is_err()
        {
            tracing::warn!("Job reaper did not stop in time");
        }

        let attached = self.attached.into_inner();
        for entry in &attached {
            self.registry
                .unregister_service(
                    entry.producer.job_type(),
                    &self.config.host_url,
                    &entry.path,
                )
                .await;
        }
        for entry in &attached {
            entry.producer.shutdown().await;
            tracing::debug!(job_type = entry.producer.job_type(), "Job producer drained");
        }

        self.workflows.shutdown().await;
        tracing::info!("Coordinator stopped");
    }
}
