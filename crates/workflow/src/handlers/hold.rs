//! Hold the workflow until an operator approves or rejects it.

use async_trait::async_trait;
use castflow_core::workflow::{OperationInstance, WorkflowInstance};
use serde::{Deserialize, Serialize};

use crate::handler::{
    HoldInput, OperationError, OperationHandler, OperationResult, ResumableOperationHandler,
};

pub const KEY_ACTION_TITLE: &str = "hold-action-title";
pub const KEY_UI_URL: &str = "hold-ui-url";

const DEFAULT_ACTION_TITLE: &str = "Resume";

/// Payload an operator sends to resume a [`HoldHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldDecision {
    #[serde(default = "approve_by_default")]
    pub approve: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

fn approve_by_default() -> bool {
    true
}

impl Default for HoldDecision {
    fn default() -> Self {
        Self {
            approve: true,
            comment: None,
        }
    }
}

/// Pauses on start; resuming with `approve: false` fails the operation.
#[derive(Debug, Default)]
pub struct HoldHandler;

impl HoldHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperationHandler for HoldHandler {
    async fn start(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        tracing::info!(
            workflow_id = workflow.id,
            operation = ?workflow.current_operation_name(),
            "Holding for operator input",
        );
        Ok(OperationResult::pause())
    }

    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        Some(self)
    }
}

#[async_trait]
impl ResumableOperationHandler for HoldHandler {
    async fn resume(
        &self,
        workflow: &WorkflowInstance,
        input: HoldInput,
    ) -> Result<OperationResult, OperationError> {
        let decision = if input.data.is_null() {
            HoldDecision::default()
        } else {
            input.parse::<HoldDecision>()?
        };
        let name = workflow.current_operation_name().unwrap_or("hold").to_string();

        if !decision.approve {
            return Err(OperationError::Failed(
                decision
                    .comment
                    .unwrap_or_else(|| "Rejected by operator".to_string()),
            ));
        }

        let mut result = OperationResult::unchanged();
        if let Some(comment) = decision.comment {
            result = result.with_property(format!("{name}.comment"), comment);
        }
        Ok(result)
    }

    fn hold_state_ui_url(&self, operation: &OperationInstance) -> Option<String> {
        operation.configuration(KEY_UI_URL).map(str::to_string)
    }

    fn hold_action_title(&self, operation: &OperationInstance) -> String {
        operation
            .configuration(KEY_ACTION_TITLE)
            .unwrap_or(DEFAULT_ACTION_TITLE)
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_defaults_to_approve() {
        let decision: HoldDecision = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(decision.approve);
        assert!(decision.comment.is_none());
    }

    #[test]
    fn hold_details_from_configuration() {
        let def = castflow_core::workflow::OperationDefinition::new("review")
            .with_config(KEY_ACTION_TITLE, "Approve edit")
            .with_config(KEY_UI_URL, "/review/42");
        let op = OperationInstance::from_definition(&def);
        assert_eq!(HoldHandler.hold_action_title(&op), "Approve edit");
        assert_eq!(HoldHandler.hold_state_ui_url(&op).as_deref(), Some("/review/42"));

        let bare = OperationInstance::from_definition(
            &castflow_core::workflow::OperationDefinition::new("review"),
        );
        assert_eq!(HoldHandler.hold_action_title(&bare), "Resume");
        assert!(HoldHandler.hold_state_ui_url(&bare).is_none());
    }
}
