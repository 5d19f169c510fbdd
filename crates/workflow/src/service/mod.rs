//! Workflow definitions and the lifecycle of workflow instances.
//!
//! Every change to one instance happens under that instance's slot lock,
//! and at most one runner task drives an instance at a time, so operations
//! of an instance never overlap. Handlers run outside the lock; `stop`,
//! `suspend` and queries stay responsive while an operation is working.

mod runner;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use castflow_core::error::CoreError;
use castflow_core::media_package::MediaPackage;
use castflow_core::status::{OperationState, WorkflowState};
use castflow_core::store::{WorkflowFilter, WorkflowStore};
use castflow_core::types::DbId;
use castflow_core::workflow::{NewWorkflow, WorkflowDefinition, WorkflowInstance, WorkflowStatistics};
use castflow_events::EventBus;
use castflow_serviceregistry::RetentionGuard;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use validator::Validate;

use crate::handler::HoldInput;
use crate::registry::HandlerRegistry;
use runner::{Tracked, STOPPED_MESSAGE};

/// Default number of operation handlers allowed to run at once across all
/// instances.
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Default)]
struct SlotState {
    /// A runner task currently owns this instance.
    runner_active: bool,
    /// Input for the paused operation, consumed by the runner.
    pending_resume: Option<HoldInput>,
    /// Handlers have been destroyed.
    finalized: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

/// Runs workflow instances over a [`WorkflowStore`].
///
/// Construct once, wrap in an `Arc`, and call [`shutdown`](Self::shutdown)
/// before exit. Instances left `RUNNING` by a previous process are picked
/// up again by [`recover`](Self::recover).
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    events: Arc<EventBus>,
    handlers: HandlerRegistry,
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
    slots: Mutex<HashMap<DbId, Arc<Slot>>>,
    permits: Semaphore,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        events: Arc<EventBus>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            events,
            handlers,
            definitions: RwLock::new(BTreeMap::new()),
            slots: Mutex::new(HashMap::new()),
            permits: Semaphore::new(DEFAULT_CONCURRENCY),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Limit how many operation handlers run at once across all instances.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.permits = Semaphore::new(concurrency.max(1));
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), CoreError> {
        definition.validate()?;
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.id) {
            return Err(CoreError::IllegalState(format!(
                "Workflow definition '{}' is already registered",
                definition.id
            )));
        }
        tracing::info!(
            definition_id = %definition.id,
            operations = definition.operations.len(),
            "Workflow definition registered",
        );
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub async fn unregister_definition(&self, id: &str) -> bool {
        self.definitions.write().await.remove(id).is_some()
    }

    /// Registered definitions sorted by id.
    pub async fn definitions(&self) -> Vec<WorkflowDefinition> {
        self.definitions.read().await.values().cloned().collect()
    }

    pub async fn definition(&self, id: &str) -> Result<WorkflowDefinition, CoreError> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("WorkflowDefinition", id))
    }

    /// Whether every operation of `definition`, and of every exception
    /// handler workflow it can reach, has a registered handler.
    pub async fn is_runnable(&self, definition: &WorkflowDefinition) -> bool {
        let definitions = self.definitions.read().await;
        let mut visited = HashSet::new();
        self.runnable(definition, &definitions, &mut visited)
    }

    fn runnable(
        &self,
        definition: &WorkflowDefinition,
        definitions: &BTreeMap<String, WorkflowDefinition>,
        visited: &mut HashSet<String>,
    ) -> bool {
        // Reaching a definition twice is a cycle; it was judged on first visit.
        if !visited.insert(definition.id.clone()) {
            return true;
        }
        definition.operations.iter().all(|op| {
            self.handlers.contains(&op.name)
                && op.exception_handler_workflow.as_ref().is_none_or(|catch| {
                    definitions
                        .get(catch)
                        .is_some_and(|c| self.runnable(c, definitions, visited))
                })
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create an instance of `definition` and start running it.
    ///
    /// A definition without operations succeeds immediately. Otherwise the
    /// returned snapshot is `RUNNING` and a runner task takes over.
    pub async fn start(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        media_package: MediaPackage,
        properties: BTreeMap<String, String>,
        parent_id: Option<DbId>,
    ) -> Result<WorkflowInstance, CoreError> {
        definition.validate()?;
        if let Some(parent_id) = parent_id {
            self.load(parent_id).await?;
        }
        if !self.is_runnable(definition).await {
            return Err(CoreError::IllegalState(format!(
                "Workflow definition '{}' uses operations without a registered handler",
                definition.id
            )));
        }

        let mut new = NewWorkflow::from_definition(definition, media_package, properties);
        new.parent_id = parent_id;
        let instance = self.store.insert_workflow(new).await?;
        let id = instance.id;
        let slot = self.slot(id).await;
        let mut state = slot.state.lock().await;

        let mut tracked = Tracked::new(instance);
        if tracked.wf.operations.is_empty() {
            tracked.set_state(WorkflowState::Succeeded)?;
            let wf = self.commit(tracked).await?;
            tracing::info!(workflow_id = id, definition_id = %definition.id, "Empty workflow succeeded");
            self.finalize(&wf, &mut state).await;
            return Ok(wf);
        }

        tracked.set_state(WorkflowState::Running)?;
        let wf = self.commit(tracked).await?;
        tracing::info!(
            workflow_id = id,
            definition_id = %definition.id,
            operations = wf.operations.len(),
            parent_id = ?parent_id,
            "Workflow started",
        );
        self.spawn_runner(id, &slot, &mut state);
        Ok(wf)
    }

    /// Continue a `PAUSED` workflow.
    ///
    /// If the current operation is on hold its handler's `resume` entry
    /// point receives `input`; otherwise (an externally suspended
    /// workflow) the next operation starts. `input.properties` are merged
    /// into the workflow properties first. Anything but `PAUSED` is
    /// rejected with [`CoreError::IllegalState`] and left unchanged.
    pub async fn resume(
        self: &Arc<Self>,
        id: DbId,
        input: HoldInput,
    ) -> Result<WorkflowInstance, CoreError> {
        let slot = self.slot_for(id).await?;
        let mut state = slot.state.lock().await;
        let wf = self.load(id).await?;
        if wf.state != WorkflowState::Paused {
            return Err(CoreError::IllegalState(format!(
                "Workflow {id} is {}; only PAUSED workflows can be resumed",
                wf.state
            )));
        }

        let mut tracked = Tracked::new(wf);
        tracked
            .wf
            .properties
            .extend(input.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        tracked.set_state(WorkflowState::Running)?;

        let index = tracked.wf.current_operation;
        let held = tracked
            .wf
            .current()
            .is_some_and(|op| op.state == OperationState::Paused);
        if held {
            tracked.set_operation_state(index, OperationState::Running)?;
            if let Some(op) = tracked.wf.current_mut() {
                op.hold_action_title = None;
                op.hold_state_ui_url = None;
            }
            state.pending_resume = Some(input);
        }

        let wf = self.commit(tracked).await?;
        tracing::info!(
            workflow_id = id,
            operation = ?wf.current_operation_name(),
            held,
            "Workflow resumed",
        );
        self.spawn_runner(id, &slot, &mut state);
        Ok(wf)
    }

    /// Pause a `RUNNING` workflow from outside.
    ///
    /// An operation already working finishes and its result is kept, but
    /// the next operation does not start until [`resume`](Self::resume).
    pub async fn suspend(&self, id: DbId) -> Result<WorkflowInstance, CoreError> {
        let slot = self.slot_for(id).await?;
        let _state = slot.state.lock().await;
        let wf = self.load(id).await?;
        if wf.state != WorkflowState::Running {
            return Err(CoreError::IllegalState(format!(
                "Workflow {id} is {}; only RUNNING workflows can be suspended",
                wf.state
            )));
        }

        let mut tracked = Tracked::new(wf);
        tracked.set_state(WorkflowState::Paused)?;
        let wf = self.commit(tracked).await?;
        tracing::info!(workflow_id = id, operation = ?wf.current_operation_name(), "Workflow suspended");
        Ok(wf)
    }

    /// Stop a workflow for good.
    ///
    /// An operation that is working or on hold is marked `FAILED`. A
    /// handler still running is not interrupted; whatever it returns is
    /// discarded. Stopping a terminal workflow is an
    /// [`CoreError::IllegalState`].
    pub async fn stop(&self, id: DbId) -> Result<WorkflowInstance, CoreError> {
        let slot = self.slot_for(id).await?;
        let mut state = slot.state.lock().await;
        let wf = self.load(id).await?;
        if wf.is_terminal() {
            return Err(CoreError::IllegalState(format!(
                "Workflow {id} is already {}",
                wf.state
            )));
        }

        let mut tracked = Tracked::new(wf);
        let index = tracked.wf.current_operation;
        let active = tracked
            .wf
            .current()
            .is_some_and(|op| matches!(op.state, OperationState::Running | OperationState::Paused));
        if active {
            tracked.fail_operation(index, STOPPED_MESSAGE)?;
        }
        tracked.set_state(WorkflowState::Stopped)?;
        let wf = self.commit(tracked).await?;
        state.pending_resume = None;
        tracing::info!(workflow_id = id, operation = ?wf.current_operation_name(), "Workflow stopped");

        if !state.runner_active {
            self.finalize(&wf, &mut state).await;
        }
        Ok(wf)
    }

    /// Delete a terminal instance.
    ///
    /// A stopped instance whose handler is still running cannot be removed
    /// until the runner has let go of it.
    pub async fn remove(&self, id: DbId) -> Result<(), CoreError> {
        let wf = self.load(id).await?;
        if !wf.is_terminal() {
            return Err(CoreError::IllegalState(format!(
                "Workflow {id} is {}; only finished workflows can be removed",
                wf.state
            )));
        }

        // No slot means the instance was already cleaned up.
        let slot = self.slots.lock().await.get(&id).cloned();
        if let Some(slot) = slot {
            let mut state = slot.state.lock().await;
            if state.runner_active {
                return Err(CoreError::IllegalState(format!(
                    "Workflow {id} still has an operation handler running"
                )));
            }
            self.finalize(&wf, &mut state).await;
        }

        if !self.store.delete_workflow(id).await? {
            return Err(CoreError::not_found("Workflow", id));
        }
        tracing::info!(workflow_id = id, "Workflow removed");
        Ok(())
    }

    /// Restart runners for `RUNNING` and `FAILING` instances nobody is
    /// driving, e.g. after a restart. Returns how many were picked up.
    ///
    /// An operation interrupted mid-handler is started again from scratch.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, CoreError> {
        let mut recovered = 0;
        for workflow_state in [WorkflowState::Running, WorkflowState::Failing] {
            let instances = self
                .store
                .list_workflows(&WorkflowFilter::default().with_state(workflow_state))
                .await?;
            for wf in instances {
                let slot = self.slot(wf.id).await;
                let mut state = slot.state.lock().await;
                if !state.runner_active {
                    self.spawn_runner(wf.id, &slot, &mut state);
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered workflow instances");
        }
        Ok(recovered)
    }

    /// Stop all runners and wait for them to exit. Instances keep their
    /// stored state for [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Workflow service stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: DbId) -> Result<WorkflowInstance, CoreError> {
        self.load(id).await
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowInstance>, CoreError> {
        self.store.list_workflows(filter).await
    }

    /// Count instances, optionally narrowed to a state and to the
    /// operation they are positioned on.
    pub async fn count_workflows(
        &self,
        state: Option<WorkflowState>,
        operation: Option<&str>,
    ) -> Result<i64, CoreError> {
        let mut filter = WorkflowFilter::default();
        if let Some(state) = state {
            filter = filter.with_state(state);
        }
        if let Some(operation) = operation {
            filter = filter.with_current_operation(operation);
        }
        self.store.count_workflows(&filter).await
    }

    pub async fn statistics(&self) -> Result<WorkflowStatistics, CoreError> {
        let instances = self.store.list_workflows(&WorkflowFilter::default()).await?;
        Ok(WorkflowStatistics::collect(&instances))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, id: DbId) -> Result<WorkflowInstance, CoreError> {
        self.store
            .find_workflow(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Workflow", id))
    }

    async fn slot(&self, id: DbId) -> Arc<Slot> {
        Arc::clone(self.slots.lock().await.entry(id).or_default())
    }

    /// Slot of an existing, non-terminal instance.
    async fn slot_for(&self, id: DbId) -> Result<Arc<Slot>, CoreError> {
        let wf = self.load(id).await?;
        if wf.is_terminal() {
            return Err(CoreError::IllegalState(format!(
                "Workflow {id} is already {}",
                wf.state
            )));
        }
        Ok(self.slot(id).await)
    }

    fn spawn_runner(self: &Arc<Self>, id: DbId, slot: &Arc<Slot>, state: &mut SlotState) {
        if state.runner_active {
            return;
        }
        state.runner_active = true;
        let service = Arc::clone(self);
        let slot = Arc::clone(slot);
        self.tracker.spawn(async move { service.drive(id, slot).await });
    }

    /// Store the instance, then publish the events its changes produced.
    async fn commit(&self, tracked: Tracked) -> Result<WorkflowInstance, CoreError> {
        let (wf, events) = tracked.into_parts();
        self.store.update_workflow(&wf).await?;
        for event in events {
            self.events.publish(event);
        }
        Ok(wf)
    }

    /// Destroy every operation's handler once the instance is terminal.
    async fn finalize(&self, wf: &WorkflowInstance, state: &mut SlotState) {
        if std::mem::replace(&mut state.finalized, true) {
            return;
        }
        for op in wf.all_operations() {
            let Some(handler) = self.handlers.get(&op.name) else {
                continue;
            };
            match AssertUnwindSafe(handler.destroy(wf, op)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    workflow_id = wf.id,
                    operation = %op.name,
                    error = %e,
                    "Operation cleanup failed",
                ),
                Err(_) => tracing::error!(
                    workflow_id = wf.id,
                    operation = %op.name,
                    "Operation cleanup panicked",
                ),
            }
        }
        self.slots.lock().await.remove(&wf.id);
        tracing::info!(
            workflow_id = wf.id,
            state = %wf.state,
            errors = wf.error_messages.len(),
            "Workflow finished",
        );
    }
}

#[async_trait]
impl RetentionGuard for WorkflowService {
    async fn referenced_job_ids(&self) -> Result<HashSet<DbId>, CoreError> {
        let instances = self.store.list_workflows(&WorkflowFilter::default()).await?;
        Ok(instances.iter().flat_map(|wf| wf.job_ids()).collect())
    }
}
