//! Row mapping for the `workflows` table.
//!
//! The media package, operation list and properties are stored as JSONB;
//! the operation list is the full runtime state of each operation.

use std::collections::BTreeMap;

use castflow_core::error::CoreError;
use castflow_core::media_package::MediaPackage;
use castflow_core::status::{StatusId, WorkflowState};
use castflow_core::types::{DbId, Timestamp};
use castflow_core::workflow::{OperationInstance, WorkflowInstance};
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `workflows` table.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: DbId,
    pub definition_id: String,
    pub title: Option<String>,
    pub state_id: StatusId,
    pub media_package: Json<MediaPackage>,
    pub operations: Json<Vec<OperationInstance>>,
    pub discarded_operations: Json<Vec<OperationInstance>>,
    pub current_operation: i32,
    pub properties: Json<BTreeMap<String, String>>,
    pub error_messages: Vec<String>,
    pub parent_id: Option<DbId>,
    pub date_created: Timestamp,
    pub date_completed: Option<Timestamp>,
}

impl TryFrom<WorkflowRow> for WorkflowInstance {
    type Error = CoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let state = WorkflowState::from_id(row.state_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "Workflow {} has unknown state id {}",
                row.id, row.state_id
            ))
        })?;
        let current_operation = usize::try_from(row.current_operation).map_err(|_| {
            CoreError::Internal(format!(
                "Workflow {} has negative operation index {}",
                row.id, row.current_operation
            ))
        })?;
        Ok(WorkflowInstance {
            id: row.id,
            definition_id: row.definition_id,
            title: row.title,
            state,
            media_package: row.media_package.0,
            operations: row.operations.0,
            discarded_operations: row.discarded_operations.0,
            current_operation,
            properties: row.properties.0,
            error_messages: row.error_messages,
            parent_id: row.parent_id,
            date_created: row.date_created,
            date_completed: row.date_completed,
        })
    }
}

/// Operation index as stored in the `current_operation` column.
pub fn operation_index(index: usize) -> Result<i32, CoreError> {
    i32::try_from(index)
        .map_err(|_| CoreError::Validation(format!("Operation index {index} out of range")))
}
