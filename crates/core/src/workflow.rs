//! Workflow definitions and instances.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::media_package::MediaPackage;
use crate::status::{OperationState, WorkflowState};
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// One step of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OperationDefinition {
    /// Handler name, e.g. `"encode"` or `"hold"`.
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub description: Option<String>,
    /// Handler configuration. Values may contain `${key}` placeholders.
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    /// When `false` the operation is continuable: a failure marks it
    /// `FAILED` and the workflow carries on.
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
    /// Definition whose operations replace the remaining ones after a
    /// failure.
    pub exception_handler_workflow: Option<String>,
    /// Run only if this evaluates to `true`.
    pub execute_condition: Option<String>,
    /// Skip if this evaluates to `true`.
    pub skip_condition: Option<String>,
}

fn default_fail_on_error() -> bool {
    true
}

impl OperationDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            configuration: BTreeMap::new(),
            fail_on_error: true,
            exception_handler_workflow: None,
            execute_condition: None,
            skip_condition: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn continuable(mut self) -> Self {
        self.fail_on_error = false;
        self
    }

    pub fn with_exception_handler(mut self, definition_id: impl Into<String>) -> Self {
        self.exception_handler_workflow = Some(definition_id.into());
        self
    }

    pub fn with_execute_condition(mut self, condition: impl Into<String>) -> Self {
        self.execute_condition = Some(condition.into());
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }
}

/// An ordered list of operations, instantiated against a media package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WorkflowDefinition {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[validate(nested)]
    pub operations: Vec<OperationDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, operations: Vec<OperationDefinition>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            operations,
        }
    }

    /// Fresh operation instances for this definition.
    pub fn instantiate_operations(&self) -> Vec<OperationInstance> {
        self.operations
            .iter()
            .map(OperationInstance::from_definition)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Runtime state of one operation inside a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInstance {
    pub name: String,
    pub description: Option<String>,
    pub state: OperationState,
    pub configuration: BTreeMap<String, String>,
    pub fail_on_error: bool,
    pub exception_handler_workflow: Option<String>,
    pub execute_condition: Option<String>,
    pub skip_condition: Option<String>,
    /// Set while paused on a resumable handler.
    pub hold_action_title: Option<String>,
    pub hold_state_ui_url: Option<String>,
    /// Jobs dispatched on behalf of this operation.
    #[serde(default)]
    pub job_ids: Vec<DbId>,
    pub error_message: Option<String>,
    pub date_started: Option<Timestamp>,
    pub date_completed: Option<Timestamp>,
}

impl OperationInstance {
    pub fn from_definition(definition: &OperationDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            state: OperationState::Instantiated,
            configuration: definition.configuration.clone(),
            fail_on_error: definition.fail_on_error,
            exception_handler_workflow: definition.exception_handler_workflow.clone(),
            execute_condition: definition.execute_condition.clone(),
            skip_condition: definition.skip_condition.clone(),
            hold_action_title: None,
            hold_state_ui_url: None,
            job_ids: Vec::new(),
            error_message: None,
            date_started: None,
            date_completed: None,
        }
    }

    pub fn configuration(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).map(String::as_str)
    }

    /// Required configuration value, or a validation error naming the key.
    pub fn required_configuration(&self, key: &str) -> Result<&str, CoreError> {
        self.configuration(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Operation '{}' requires configuration key '{key}'",
                    self.name
                ))
            })
    }

    /// Validate and apply a state change.
    pub fn transition(&mut self, to: OperationState) -> Result<(), CoreError> {
        self.state.validate_transition(to)?;
        self.state = to;
        Ok(())
    }
}

/// A running (or finished) execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: DbId,
    pub definition_id: String,
    pub title: Option<String>,
    pub state: WorkflowState,
    pub media_package: MediaPackage,
    pub operations: Vec<OperationInstance>,
    /// Operations cut from the plan when an exception handler workflow took
    /// over. They never run but are still cleaned up at the end.
    #[serde(default)]
    pub discarded_operations: Vec<OperationInstance>,
    /// Index into `operations`; equals `operations.len()` once the end has
    /// been passed.
    pub current_operation: usize,
    pub properties: BTreeMap<String, String>,
    pub error_messages: Vec<String>,
    pub parent_id: Option<DbId>,
    pub date_created: Timestamp,
    pub date_completed: Option<Timestamp>,
}

impl WorkflowInstance {
    pub fn current(&self) -> Option<&OperationInstance> {
        self.operations.get(self.current_operation)
    }

    pub fn current_mut(&mut self) -> Option<&mut OperationInstance> {
        self.operations.get_mut(self.current_operation)
    }

    /// Name of the current operation, `None` past the end.
    pub fn current_operation_name(&self) -> Option<&str> {
        self.current().map(|op| op.name.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Validate and apply a workflow-level state change.
    pub fn transition(&mut self, to: WorkflowState) -> Result<(), CoreError> {
        self.state.validate_transition(to)?;
        self.state = to;
        Ok(())
    }

    /// Jobs dispatched by any operation of this workflow.
    pub fn job_ids(&self) -> impl Iterator<Item = DbId> + '_ {
        self.operations.iter().flat_map(|op| op.job_ids.iter().copied())
    }

    /// Replace everything after `index` with `replacement`, keeping the
    /// removed operations in `discarded_operations`.
    pub fn splice_after(&mut self, index: usize, replacement: Vec<OperationInstance>) {
        let cut = self.operations.split_off((index + 1).min(self.operations.len()));
        self.discarded_operations.extend(cut);
        self.operations.extend(replacement);
    }

    /// Every operation the instance was ever planned to run.
    pub fn all_operations(&self) -> impl Iterator<Item = &OperationInstance> + '_ {
        self.operations.iter().chain(&self.discarded_operations)
    }

    /// Whether some operation is still `RUNNING` or `PAUSED`.
    pub fn has_active_operation(&self) -> bool {
        self.operations.iter().any(|op| {
            matches!(op.state, OperationState::Running | OperationState::Paused)
        })
    }
}

/// DTO for creating a workflow instance record.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub definition_id: String,
    pub title: Option<String>,
    pub media_package: MediaPackage,
    pub operations: Vec<OperationInstance>,
    pub properties: BTreeMap<String, String>,
    pub parent_id: Option<DbId>,
}

impl NewWorkflow {
    pub fn from_definition(
        definition: &WorkflowDefinition,
        media_package: MediaPackage,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            definition_id: definition.id.clone(),
            title: definition.title.clone(),
            media_package,
            operations: definition.instantiate_operations(),
            properties,
            parent_id: None,
        }
    }

    /// Materialize the `INSTANTIATED` record a store inserts.
    pub fn into_instance(self, id: DbId, now: Timestamp) -> WorkflowInstance {
        WorkflowInstance {
            id,
            definition_id: self.definition_id,
            title: self.title,
            state: WorkflowState::Instantiated,
            media_package: self.media_package,
            operations: self.operations,
            discarded_operations: Vec::new(),
            current_operation: 0,
            properties: self.properties,
            error_messages: Vec::new(),
            parent_id: self.parent_id,
            date_created: now,
            date_completed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running and paused instances currently positioned on one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatistics {
    pub operation: String,
    pub running: i64,
    pub paused: i64,
}

/// Per-definition breakdown of active instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionStatistics {
    pub definition_id: String,
    pub running: i64,
    pub paused: i64,
    pub operations: Vec<OperationStatistics>,
}

/// Instance counts per state, with a per-definition breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total: i64,
    pub instantiated: i64,
    pub running: i64,
    pub paused: i64,
    pub stopped: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub failing: i64,
    pub definitions: Vec<DefinitionStatistics>,
}

impl WorkflowStatistics {
    /// Aggregate statistics over a set of instances.
    pub fn collect<'a>(instances: impl IntoIterator<Item = &'a WorkflowInstance>) -> Self {
        let mut stats = WorkflowStatistics::default();
        let mut by_definition: BTreeMap<&str, (DefinitionStatistics, BTreeMap<&str, OperationStatistics>)> =
            BTreeMap::new();

        for wf in instances {
            stats.total += 1;
            match wf.state {
                WorkflowState::Instantiated => stats.instantiated += 1,
                WorkflowState::Running => stats.running += 1,
                WorkflowState::Paused => stats.paused += 1,
                WorkflowState::Stopped => stats.stopped += 1,
                WorkflowState::Succeeded => stats.succeeded += 1,
                WorkflowState::Failed => stats.failed += 1,
                WorkflowState::Failing => stats.failing += 1,
            }

            let running = wf.state == WorkflowState::Running;
            let paused = wf.state == WorkflowState::Paused;
            if !running && !paused {
                continue;
            }

            let (def, ops) = by_definition
                .entry(wf.definition_id.as_str())
                .or_insert_with(|| {
                    (
                        DefinitionStatistics {
                            definition_id: wf.definition_id.clone(),
                            ..Default::default()
                        },
                        BTreeMap::new(),
                    )
                });
            def.running += i64::from(running);
            def.paused += i64::from(paused);

            if let Some(name) = wf.current_operation_name() {
                let op = ops.entry(name).or_insert_with(|| OperationStatistics {
                    operation: name.to_string(),
                    ..Default::default()
                });
                op.running += i64::from(running);
                op.paused += i64::from(paused);
            }
        }

        stats.definitions = by_definition
            .into_values()
            .map(|(mut def, ops)| {
                def.operations = ops.into_values().collect();
                def
            })
            .collect();
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "ingest",
            vec![
                OperationDefinition::new("inspect"),
                OperationDefinition::new("encode").with_config("profile", "${profile}"),
                OperationDefinition::new("publish").continuable(),
            ],
        )
    }

    fn instance(state: WorkflowState, current: usize) -> WorkflowInstance {
        let mut wf = NewWorkflow::from_definition(&definition(), MediaPackage::new(), BTreeMap::new())
            .into_instance(1, Utc::now());
        wf.state = state;
        wf.current_operation = current;
        wf
    }

    #[test]
    fn splice_keeps_discarded_operations() {
        let mut wf = instance(WorkflowState::Failing, 0);
        let catch = OperationInstance::from_definition(&OperationDefinition::new("cleanup"));
        wf.splice_after(0, vec![catch]);

        let names: Vec<&str> = wf.operations.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["inspect", "cleanup"]);
        let discarded: Vec<&str> = wf
            .discarded_operations
            .iter()
            .map(|op| op.name.as_str())
            .collect();
        assert_eq!(discarded.len(), 2);
        assert_eq!(wf.all_operations().count(), 4);
    }

    #[test]
    fn instantiation_copies_operation_settings() {
        let wf = instance(WorkflowState::Instantiated, 0);
        assert_eq!(wf.operations.len(), 3);
        assert!(wf
            .operations
            .iter()
            .all(|op| op.state == OperationState::Instantiated));
        assert_eq!(wf.operations[1].configuration("profile"), Some("${profile}"));
        assert!(!wf.operations[2].fail_on_error);
        assert_eq!(wf.current_operation_name(), Some("inspect"));
    }

    #[test]
    fn current_operation_past_end() {
        let wf = instance(WorkflowState::Succeeded, 3);
        assert!(wf.current().is_none());
        assert!(wf.current_operation_name().is_none());
    }

    #[test]
    fn required_configuration_reports_key() {
        let wf = instance(WorkflowState::Running, 0);
        let err = wf.operations[0].required_configuration("job-type").unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("job-type"));
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let mut wf = instance(WorkflowState::Succeeded, 3);
        assert_matches!(wf.transition(WorkflowState::Running), Err(CoreError::IllegalState(_)));
        assert_eq!(wf.state, WorkflowState::Succeeded);
    }

    #[test]
    fn definition_validation() {
        let bad = WorkflowDefinition::new("", vec![]);
        assert!(bad.validate().is_err());
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn fail_on_error_defaults_to_true_when_deserialized() {
        let op: OperationDefinition =
            serde_json::from_str(r#"{"name":"encode","description":null,"exception_handler_workflow":null,"execute_condition":null,"skip_condition":null}"#)
                .unwrap();
        assert!(op.fail_on_error);
        assert!(op.configuration.is_empty());
    }

    #[test]
    fn statistics_group_active_instances() {
        let wfs = vec![
            instance(WorkflowState::Running, 1),
            instance(WorkflowState::Running, 1),
            instance(WorkflowState::Paused, 2),
            instance(WorkflowState::Succeeded, 3),
        ];
        let stats = WorkflowStatistics::collect(&wfs);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.definitions.len(), 1);

        let def = &stats.definitions[0];
        assert_eq!(def.running, 2);
        assert_eq!(def.paused, 1);
        assert_eq!(
            def.operations,
            vec![
                OperationStatistics {
                    operation: "encode".to_string(),
                    running: 2,
                    paused: 0
                },
                OperationStatistics {
                    operation: "publish".to_string(),
                    running: 0,
                    paused: 1
                },
            ]
        );
    }
}
