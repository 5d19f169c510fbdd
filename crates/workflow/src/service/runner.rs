//! The per-instance runner.
//!
//! One loop per instance: under the slot lock it loads the instance and
//! prepares the next handler call, releases the lock for the call, then
//! re-locks and applies the outcome to a freshly loaded copy.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use castflow_core::error::CoreError;
use castflow_core::event_types::{self, ENTITY_WORKFLOW};
use castflow_core::properties;
use castflow_core::status::{OperationState, WorkflowState};
use castflow_core::types::DbId;
use castflow_core::workflow::WorkflowInstance;
use castflow_events::DomainEvent;
use castflow_serviceregistry::panic_message;
use chrono::Utc;
use futures::FutureExt;

use super::{Slot, SlotState, WorkflowService};
use crate::handler::{Action, HoldInput, OperationError, OperationResult};

/// Failure description of an operation cut short by `stop`.
pub(super) const STOPPED_MESSAGE: &str = "Workflow stopped";

// ---------------------------------------------------------------------------
// Tracked changes
// ---------------------------------------------------------------------------

/// A workflow instance plus the events its changes publish once stored.
pub(super) struct Tracked {
    pub(super) wf: WorkflowInstance,
    events: Vec<DomainEvent>,
}

impl Tracked {
    pub(super) fn new(wf: WorkflowInstance) -> Self {
        Self {
            wf,
            events: Vec::new(),
        }
    }

    pub(super) fn into_parts(self) -> (WorkflowInstance, Vec<DomainEvent>) {
        (self.wf, self.events)
    }

    pub(super) fn set_state(&mut self, to: WorkflowState) -> Result<(), CoreError> {
        let from = self.wf.state;
        self.wf.transition(to)?;
        if to.is_terminal() {
            self.wf.date_completed = Some(Utc::now());
        }
        self.events.push(
            DomainEvent::new(event_types::WORKFLOW_STATE_CHANGED)
                .with_source(ENTITY_WORKFLOW, self.wf.id)
                .with_payload(serde_json::json!({
                    "definition_id": self.wf.definition_id,
                    "from": from,
                    "to": to,
                })),
        );
        Ok(())
    }

    pub(super) fn set_operation_state(
        &mut self,
        index: usize,
        to: OperationState,
    ) -> Result<(), CoreError> {
        let workflow_id = self.wf.id;
        let op = self.wf.operations.get_mut(index).ok_or_else(|| {
            CoreError::Internal(format!("Workflow {workflow_id} has no operation {index}"))
        })?;
        let from = op.state;
        op.transition(to)?;
        let now = Utc::now();
        if to == OperationState::Running && op.date_started.is_none() {
            op.date_started = Some(now);
        }
        if to.is_terminal() {
            op.date_completed = Some(now);
        }
        self.events.push(
            DomainEvent::new(event_types::WORKFLOW_OPERATION_CHANGED)
                .with_source(ENTITY_WORKFLOW, workflow_id)
                .with_payload(serde_json::json!({
                    "operation": op.name,
                    "index": index,
                    "from": from,
                    "to": to,
                })),
        );
        Ok(())
    }

    /// Mark an operation failed and record why on the instance.
    pub(super) fn fail_operation(
        &mut self,
        index: usize,
        message: impl Into<String>,
    ) -> Result<(), CoreError> {
        let message = message.into();
        self.set_operation_state(index, OperationState::Failed)?;
        if let Some(op) = self.wf.operations.get_mut(index) {
            self.wf.error_messages.push(format!("{}: {message}", op.name));
            op.error_message = Some(message);
        }
        Ok(())
    }

    fn advance(&mut self) {
        self.wf.current_operation += 1;
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Which handler entry point to call.
enum Invocation {
    Start,
    Skip,
    Resume(HoldInput),
}

impl Invocation {
    fn label(&self) -> &'static str {
        match self {
            Invocation::Start => "start",
            Invocation::Skip => "skip",
            Invocation::Resume(_) => "resume",
        }
    }
}

/// A handler call prepared under the slot lock.
struct Prepared {
    snapshot: WorkflowInstance,
    index: usize,
    name: String,
    invocation: Invocation,
}

/// Hold details reported by a resumable handler that paused.
struct Hold {
    action_title: String,
    ui_url: Option<String>,
}

/// A handler call that returned normally.
struct Completed {
    result: OperationResult,
    hold: Option<Hold>,
}

impl WorkflowService {
    pub(super) async fn drive(self: Arc<Self>, id: DbId, slot: Arc<Slot>) {
        tracing::debug!(workflow_id = id, "Workflow runner started");
        loop {
            let prepared = {
                let mut state = slot.state.lock().await;
                if self.cancel.is_cancelled() {
                    state.runner_active = false;
                    return;
                }
                match self.prepare(id, &mut state).await {
                    Ok(Some(prepared)) => prepared,
                    Ok(None) => {
                        state.runner_active = false;
                        tracing::debug!(workflow_id = id, "Workflow runner exited");
                        return;
                    }
                    Err(e) => {
                        state.runner_active = false;
                        tracing::error!(workflow_id = id, error = %e, "Workflow runner failed");
                        return;
                    }
                }
            };

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Left RUNNING in the store for `recover`.
                    slot.state.lock().await.runner_active = false;
                    return;
                }
                outcome = self.invoke(&prepared) => outcome,
            };

            let mut state = slot.state.lock().await;
            if let Err(e) = self.apply(&prepared, outcome, &mut state).await {
                state.runner_active = false;
                tracing::error!(
                    workflow_id = id,
                    operation = %prepared.name,
                    error = %e,
                    "Failed to record operation outcome",
                );
                return;
            }
        }
    }

    /// Work out the next handler call, or `None` when the runner should
    /// exit (paused, finished, or nothing left to run).
    async fn prepare(
        &self,
        id: DbId,
        state: &mut SlotState,
    ) -> Result<Option<Prepared>, CoreError> {
        let Some(wf) = self.store.find_workflow(id).await? else {
            // Removed after it was finalized.
            return Ok(None);
        };
        if wf.is_terminal() {
            self.finalize(&wf, state).await;
            return Ok(None);
        }
        if !wf.state.is_active() {
            return Ok(None);
        }

        let mut tracked = Tracked::new(wf);
        loop {
            let index = tracked.wf.current_operation;
            let Some(op) = tracked.wf.current() else {
                let wf = self.complete(tracked).await?;
                self.finalize(&wf, state).await;
                return Ok(None);
            };
            let name = op.name.clone();

            let invocation = match op.state {
                OperationState::Instantiated => {
                    let props = &tracked.wf.properties;
                    let ruled_out = op
                        .execute_condition
                        .as_deref()
                        .is_some_and(|c| !properties::condition_holds(c, props))
                        || op
                            .skip_condition
                            .as_deref()
                            .is_some_and(|c| properties::condition_holds(c, props));
                    let resolved = properties::resolve_configuration(&op.configuration, props);
                    if let Some(op) = tracked.wf.current_mut() {
                        op.configuration = resolved;
                    }
                    tracked.set_operation_state(index, OperationState::Running)?;
                    if ruled_out {
                        Invocation::Skip
                    } else {
                        Invocation::Start
                    }
                }
                OperationState::Running => match state.pending_resume.take() {
                    Some(input) => Invocation::Resume(input),
                    None => {
                        tracing::warn!(workflow_id = id, operation = %name, "Restarting interrupted operation");
                        Invocation::Start
                    }
                },
                OperationState::Paused => {
                    tracing::warn!(workflow_id = id, operation = %name, "Operation on hold in an active workflow");
                    return Ok(None);
                }
                OperationState::Succeeded | OperationState::Failed | OperationState::Skipped => {
                    tracked.advance();
                    continue;
                }
            };

            let snapshot = self.commit(tracked).await?;
            return Ok(Some(Prepared {
                snapshot,
                index,
                name,
                invocation,
            }));
        }
    }

    /// Call the handler outside the slot lock. Panics become failures.
    async fn invoke(&self, prepared: &Prepared) -> Result<Completed, OperationError> {
        let Some(handler) = self.handlers.get(&prepared.name) else {
            return Err(OperationError::Failed(format!(
                "No handler registered for operation '{}'",
                prepared.name
            )));
        };
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OperationError::Failed("Workflow service is shutting down".to_string()))?;

        let wf = &prepared.snapshot;
        tracing::info!(
            workflow_id = wf.id,
            operation = %prepared.name,
            entry_point = prepared.invocation.label(),
            "Running operation",
        );

        let call = async {
            match &prepared.invocation {
                Invocation::Start => handler.start(wf).await,
                Invocation::Skip => handler.skip(wf).await,
                Invocation::Resume(input) => match handler.as_resumable() {
                    Some(resumable) => resumable.resume(wf, input.clone()).await,
                    None => Err(OperationError::NotResumable(prepared.name.clone())),
                },
            }
        };
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => {
                return Err(OperationError::Failed(format!(
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            }
        };

        let pauses = result.action == Action::Pause && !matches!(prepared.invocation, Invocation::Skip);
        let hold = if pauses {
            let resumable = handler
                .as_resumable()
                .ok_or_else(|| OperationError::NotResumable(prepared.name.clone()))?;
            let op = wf.operations.get(prepared.index).ok_or_else(|| {
                OperationError::Failed(format!("Operation {} vanished", prepared.index))
            })?;
            Some(Hold {
                action_title: resumable.hold_action_title(op),
                ui_url: resumable.hold_state_ui_url(op),
            })
        } else {
            None
        };
        Ok(Completed { result, hold })
    }

    /// Apply a handler outcome to the current stored instance.
    async fn apply(
        &self,
        prepared: &Prepared,
        outcome: Result<Completed, OperationError>,
        state: &mut SlotState,
    ) -> Result<(), CoreError> {
        let id = prepared.snapshot.id;
        let wf = self.load(id).await?;
        if wf.is_terminal() {
            tracing::info!(
                workflow_id = id,
                operation = %prepared.name,
                "Discarding result for a finished workflow",
            );
            self.finalize(&wf, state).await;
            return Ok(());
        }
        let still_current = wf.current_operation == prepared.index
            && wf.current().map(|op| op.state) == Some(OperationState::Running);
        if !still_current {
            tracing::warn!(
                workflow_id = id,
                operation = %prepared.name,
                "Operation moved on while its handler ran; discarding result",
            );
            return Ok(());
        }

        let mut tracked = Tracked::new(wf);
        let failure = match outcome {
            Ok(completed) => self.apply_result(&mut tracked, prepared, completed)?,
            Err(e) => {
                if let (Some(job_id), Some(op)) =
                    (e.job_id(), tracked.wf.operations.get_mut(prepared.index))
                {
                    op.job_ids.push(job_id);
                }
                Some(e.to_string())
            }
        };
        if let Some(message) = failure {
            self.apply_failure(&mut tracked, prepared.index, message).await?;
        }

        let wf = self.commit(tracked).await?;
        if wf.is_terminal() {
            self.finalize(&wf, state).await;
        }
        Ok(())
    }

    /// Returns a failure description when the result cannot be honoured.
    fn apply_result(
        &self,
        tracked: &mut Tracked,
        prepared: &Prepared,
        completed: Completed,
    ) -> Result<Option<String>, CoreError> {
        let index = prepared.index;
        let Completed { result, hold } = completed;
        tracked.wf.properties.extend(result.properties);
        if let Some(op) = tracked.wf.operations.get_mut(index) {
            op.job_ids.extend(result.job_ids);
        }

        let action = match prepared.invocation {
            Invocation::Skip => Action::Skip,
            _ => result.action,
        };
        match action {
            Action::Continue => {
                if let Some(media_package) = result.media_package {
                    tracked.wf.media_package = media_package;
                }
                tracked.set_operation_state(index, OperationState::Succeeded)?;
                tracked.advance();
                tracing::info!(workflow_id = tracked.wf.id, operation = %prepared.name, "Operation succeeded");
            }
            Action::Skip => {
                tracked.set_operation_state(index, OperationState::Skipped)?;
                tracked.advance();
                tracing::info!(workflow_id = tracked.wf.id, operation = %prepared.name, "Operation skipped");
            }
            Action::Pause => {
                if tracked.wf.state == WorkflowState::Failing {
                    return Ok(Some("Operations cannot pause a failing workflow".to_string()));
                }
                let Some(hold) = hold else {
                    return Ok(Some(format!("Operation '{}' cannot be resumed", prepared.name)));
                };
                tracked.set_operation_state(index, OperationState::Paused)?;
                if let Some(op) = tracked.wf.operations.get_mut(index) {
                    op.hold_action_title = Some(hold.action_title);
                    op.hold_state_ui_url = hold.ui_url;
                }
                if tracked.wf.state == WorkflowState::Running {
                    tracked.set_state(WorkflowState::Paused)?;
                }
                tracing::info!(workflow_id = tracked.wf.id, operation = %prepared.name, "Workflow on hold");
            }
        }
        Ok(None)
    }

    /// Fail the operation and decide what happens to the workflow.
    async fn apply_failure(
        &self,
        tracked: &mut Tracked,
        index: usize,
        message: String,
    ) -> Result<(), CoreError> {
        let workflow_id = tracked.wf.id;
        let (name, fail_on_error, catch) = match tracked.wf.operations.get(index) {
            Some(op) => (
                op.name.clone(),
                op.fail_on_error,
                op.exception_handler_workflow.clone(),
            ),
            None => {
                return Err(CoreError::Internal(format!(
                    "Workflow {workflow_id} has no operation {index}"
                )))
            }
        };
        tracing::warn!(workflow_id, operation = %name, error = %message, "Operation failed");
        tracked.fail_operation(index, message)?;

        if !fail_on_error {
            tracked.advance();
            return Ok(());
        }

        if tracked.wf.state == WorkflowState::Paused {
            tracked.set_state(WorkflowState::Running)?;
        }
        if tracked.wf.state == WorkflowState::Running {
            tracked.set_state(WorkflowState::Failing)?;
            if let Some(catch) = catch {
                let definitions = self.definitions.read().await;
                match definitions.get(&catch) {
                    Some(definition) => {
                        tracked
                            .wf
                            .splice_after(index, definition.instantiate_operations());
                        tracked.advance();
                        tracing::info!(
                            workflow_id,
                            definition_id = %catch,
                            "Running exception handler workflow",
                        );
                        return Ok(());
                    }
                    None => tracing::warn!(
                        workflow_id,
                        definition_id = %catch,
                        "Exception handler workflow is not registered",
                    ),
                }
            }
        }
        tracked.set_state(WorkflowState::Failed)?;
        Ok(())
    }

    /// Past the last operation: `FAILING` ends `FAILED`, otherwise
    /// `SUCCEEDED`.
    async fn complete(&self, mut tracked: Tracked) -> Result<WorkflowInstance, CoreError> {
        let to = match tracked.wf.state {
            WorkflowState::Failing => WorkflowState::Failed,
            _ => WorkflowState::Succeeded,
        };
        tracked.set_state(to)?;
        let wf = self.commit(tracked).await?;
        tracing::info!(workflow_id = wf.id, state = %wf.state, "Workflow completed");
        Ok(wf)
    }
}
