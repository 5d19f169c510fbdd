//! Contracts between the engine and the logic behind each operation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use castflow_core::error::CoreError;
use castflow_core::media_package::MediaPackage;
use castflow_core::types::DbId;
use castflow_core::workflow::{OperationInstance, WorkflowInstance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// What the engine should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Mark the operation succeeded and move on.
    Continue,
    /// Hold the workflow until [`resume`](crate::WorkflowService::resume).
    Pause,
    /// Mark the operation skipped and move on, media package untouched.
    Skip,
}

/// Outcome of a handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub action: Action,
    /// Replacement media package. `None` keeps the current one.
    pub media_package: Option<MediaPackage>,
    /// Merged into the workflow properties.
    pub properties: BTreeMap<String, String>,
    /// Jobs dispatched while handling the operation.
    pub job_ids: Vec<DbId>,
}

impl OperationResult {
    fn new(action: Action) -> Self {
        Self {
            action,
            media_package: None,
            properties: BTreeMap::new(),
            job_ids: Vec::new(),
        }
    }

    /// Continue with a new media package.
    pub fn continue_with(media_package: MediaPackage) -> Self {
        Self {
            media_package: Some(media_package),
            ..Self::new(Action::Continue)
        }
    }

    /// Continue, leaving the media package as it is.
    pub fn unchanged() -> Self {
        Self::new(Action::Continue)
    }

    pub fn pause() -> Self {
        Self::new(Action::Pause)
    }

    pub fn skip() -> Self {
        Self::new(Action::Skip)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_jobs(mut self, job_ids: impl IntoIterator<Item = DbId>) -> Self {
        self.job_ids.extend(job_ids);
        self
    }
}

/// External input delivered to a paused operation on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldInput {
    /// Merged into the workflow properties before the handler resumes.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Handler-specific payload, see [`HoldInput::parse`].
    #[serde(default)]
    pub data: serde_json::Value,
}

impl HoldInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Decode the payload into the type the handler expects.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| OperationError::InvalidInput(e.to_string()))
    }
}

/// Why an operation failed.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid resume input: {0}")]
    InvalidInput(String),

    #[error("Operation '{0}' cannot be resumed")]
    NotResumable(String),

    /// A job the operation dispatched did not finish.
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: DbId, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl OperationError {
    /// Job the failed operation had already dispatched, if any.
    pub fn job_id(&self) -> Option<DbId> {
        match self {
            Self::JobFailed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

/// Logic for one workflow step.
///
/// Handlers read their configuration from
/// `workflow.current()`; `${key}` placeholders are already resolved against
/// the workflow properties when `start` or `skip` is called.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn start(&self, workflow: &WorkflowInstance) -> Result<OperationResult, OperationError>;

    /// Called instead of `start` when the operation's conditions rule it out.
    async fn skip(&self, _workflow: &WorkflowInstance) -> Result<OperationResult, OperationError> {
        Ok(OperationResult::skip())
    }

    /// Release anything held on behalf of `operation`. Called once per
    /// operation when the workflow reaches a terminal state, whether or not
    /// the operation ran.
    async fn destroy(
        &self,
        _workflow: &WorkflowInstance,
        _operation: &OperationInstance,
    ) -> Result<(), OperationError> {
        Ok(())
    }

    /// The resumable view of this handler, if it can pause.
    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        None
    }
}

/// A handler that may return [`Action::Pause`] and later continue from
/// external input.
#[async_trait]
pub trait ResumableOperationHandler: OperationHandler {
    async fn resume(
        &self,
        workflow: &WorkflowInstance,
        input: HoldInput,
    ) -> Result<OperationResult, OperationError>;

    /// Where an operator supplies the input that resumes the operation.
    fn hold_state_ui_url(&self, _operation: &OperationInstance) -> Option<String> {
        None
    }

    /// Label for the action that resumes the operation.
    fn hold_action_title(&self, _operation: &OperationInstance) -> String {
        "Resume".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, Deserialize)]
    struct Approval {
        approve: bool,
    }

    #[test]
    fn hold_input_parses_payload() {
        let input = HoldInput::new().with_data(serde_json::json!({ "approve": false }));
        let approval: Approval = input.parse().unwrap();
        assert!(!approval.approve);
    }

    #[test]
    fn hold_input_rejects_malformed_payload() {
        let input = HoldInput::new().with_data(serde_json::json!({ "approve": "maybe" }));
        assert_matches!(input.parse::<Approval>(), Err(OperationError::InvalidInput(_)));
    }

    #[test]
    fn result_builders() {
        let result = OperationResult::unchanged()
            .with_property("encoded", "true")
            .with_jobs([3, 4]);
        assert_eq!(result.action, Action::Continue);
        assert!(result.media_package.is_none());
        assert_eq!(result.properties["encoded"], "true");
        assert_eq!(result.job_ids, vec![3, 4]);
        assert_eq!(OperationResult::skip().action, Action::Skip);
    }

    #[test]
    fn action_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Action::Pause).unwrap(), "\"PAUSE\"");
    }
}
