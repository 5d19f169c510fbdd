#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use castflow_core::media_package::{ElementKind, MediaPackage, MediaPackageElement};
use castflow_core::status::WorkflowState;
use castflow_core::store::MemoryStore;
use castflow_core::types::DbId;
use castflow_core::workflow::{OperationInstance, WorkflowInstance};
use castflow_events::EventBus;
use castflow_workflow::{
    HandlerRegistry, HoldInput, OperationError, OperationHandler, OperationResult,
    ResumableOperationHandler, WorkflowService,
};
use tokio::sync::Notify;

/// Shared record of handler calls, e.g. `start:encode`, `destroy:encode`.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// Add a `{name}/done` catalog and continue.
    Continue,
    Fail,
    Pause,
    Panic,
    /// Return `PAUSE` without being resumable.
    PauseUnresumable,
}

/// Handler whose outcome is fixed up front.
pub struct Scripted {
    name: String,
    log: CallLog,
    behaviour: Behaviour,
}

impl Scripted {
    pub fn new(name: &str, log: &CallLog, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            behaviour,
        })
    }

    fn done(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        let mut mp = workflow.media_package.clone();
        mp.add(MediaPackageElement::new(
            ElementKind::Catalog,
            format!("{}/done", self.name),
            None,
        ))?;
        Ok(OperationResult::continue_with(mp).with_property(format!("{}.ran", self.name), "true"))
    }
}

#[async_trait]
impl OperationHandler for Scripted {
    async fn start(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        self.log.push(format!("start:{}", self.name));
        match self.behaviour {
            Behaviour::Continue => self.done(workflow),
            Behaviour::Fail => Err(OperationError::Failed(format!("{} broke", self.name))),
            Behaviour::Pause | Behaviour::PauseUnresumable => Ok(OperationResult::pause()),
            Behaviour::Panic => panic!("{} exploded", self.name),
        }
    }

    async fn skip(&self, _workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        self.log.push(format!("skip:{}", self.name));
        Ok(OperationResult::skip())
    }

    async fn destroy(
        &self,
        _workflow: &WorkflowInstance,
        operation: &OperationInstance,
    ) -> Result<(), OperationError> {
        self.log.push(format!("destroy:{}", operation.name));
        Ok(())
    }

    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        match self.behaviour {
            Behaviour::Pause => Some(self),
            _ => None,
        }
    }
}

#[async_trait]
impl ResumableOperationHandler for Scripted {
    async fn resume(
        &self,
        workflow: &WorkflowInstance,
        input: HoldInput,
    ) -> Result<OperationResult, OperationError> {
        self.log.push(format!("resume:{}", self.name));
        if input.data.get("reject").is_some() {
            return Err(OperationError::Failed("rejected".to_string()));
        }
        self.done(workflow)
    }

    fn hold_action_title(&self, _operation: &OperationInstance) -> String {
        format!("Review {}", self.name)
    }

    fn hold_state_ui_url(&self, _operation: &OperationInstance) -> Option<String> {
        Some(format!("/hold/{}", self.name))
    }
}

/// Handler that blocks until released.
pub struct Gated {
    name: String,
    log: CallLog,
    pub started: Notify,
    pub release: Notify,
}

impl Gated {
    pub fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl OperationHandler for Gated {
    async fn start(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        self.log.push(format!("start:{}", self.name));
        self.started.notify_one();
        self.release.notified().await;
        let mut mp = workflow.media_package.clone();
        mp.add(MediaPackageElement::new(ElementKind::Track, "gated/output", None))?;
        Ok(OperationResult::continue_with(mp))
    }

    async fn destroy(
        &self,
        _workflow: &WorkflowInstance,
        operation: &OperationInstance,
    ) -> Result<(), OperationError> {
        self.log.push(format!("destroy:{}", operation.name));
        Ok(())
    }
}

pub fn service(handlers: HandlerRegistry) -> (Arc<WorkflowService>, Arc<EventBus>) {
    let events = Arc::new(EventBus::default());
    let service = Arc::new(WorkflowService::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&events),
        handlers,
    ));
    (service, events)
}

/// Builder for a [`HandlerRegistry`] in tests.
#[derive(Default)]
pub struct Handlers(HandlerRegistry);

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: &str, handler: Arc<dyn OperationHandler>) -> Self {
        self.0.register(operation, handler).unwrap();
        self
    }

    pub fn build(self) -> HandlerRegistry {
        self.0
    }
}

pub fn no_properties() -> BTreeMap<String, String> {
    BTreeMap::new()
}

pub fn package() -> MediaPackage {
    MediaPackage::new().with_title("Lecture 1")
}

/// Poll until the workflow satisfies `predicate`.
pub async fn wait_until<F>(service: &WorkflowService, id: DbId, predicate: F) -> WorkflowInstance
where
    F: Fn(&WorkflowInstance) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let wf = service.get(id).await.unwrap();
        if predicate(&wf) {
            return wf;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {id} stuck in {} at operation {}",
            wf.state,
            wf.current_operation
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(
    service: &WorkflowService,
    id: DbId,
    state: WorkflowState,
) -> WorkflowInstance {
    wait_until(service, id, |wf| wf.state == state).await
}

/// Poll until the call log satisfies `predicate`.
pub async fn wait_for_log<F>(log: &CallLog, predicate: F)
where
    F: Fn(&CallLog) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate(log) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "log never matched: {:?}",
            log.entries()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
