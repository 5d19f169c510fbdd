//! Repository for the `workflows` table.

use castflow_core::status::WorkflowState;
use castflow_core::store::WorkflowFilter;
use castflow_core::types::DbId;
use castflow_core::workflow::{NewWorkflow, WorkflowInstance};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::workflow::WorkflowRow;

/// Column list for `workflows` queries.
const COLUMNS: &str = "\
    id, definition_id, title, state_id, media_package, operations, \
    discarded_operations, current_operation, properties, error_messages, parent_id, \
    date_created, date_completed";

/// WHERE clause for [`WorkflowFilter`]; binds $1..$4 in field order.
const FILTER: &str = "\
    ($1::SMALLINT IS NULL OR state_id = $1) \
    AND ($2::TEXT IS NULL OR current_operation_name = $2) \
    AND ($3::TEXT IS NULL OR definition_id = $3) \
    AND ($4::BIGINT IS NULL OR parent_id = $4)";

pub struct WorkflowRepo;

impl WorkflowRepo {
    /// Insert a new `INSTANTIATED` instance positioned on its first
    /// operation.
    pub async fn insert(pool: &PgPool, input: &NewWorkflow) -> Result<WorkflowRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO workflows \
                (definition_id, title, state_id, media_package, operations, \
                 current_operation, current_operation_name, properties, parent_id) \
             VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(&input.definition_id)
            .bind(&input.title)
            .bind(WorkflowState::Instantiated.id())
            .bind(Json(&input.media_package))
            .bind(Json(&input.operations))
            .bind(input.operations.first().map(|op| op.name.as_str()))
            .bind(Json(&input.properties))
            .bind(input.parent_id)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<WorkflowRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflows WHERE id = $1");
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Overwrite the stored instance. Returns the number of rows changed.
    pub async fn update(
        pool: &PgPool,
        workflow: &WorkflowInstance,
        current_operation: i32,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflows SET \
                title = $2, \
                state_id = $3, \
                media_package = $4, \
                operations = $5, \
                current_operation = $6, \
                current_operation_name = $7, \
                properties = $8, \
                error_messages = $9, \
                date_completed = $10, \
                discarded_operations = $11 \
             WHERE id = $1",
        )
        .bind(workflow.id)
        .bind(&workflow.title)
        .bind(workflow.state.id())
        .bind(Json(&workflow.media_package))
        .bind(Json(&workflow.operations))
        .bind(current_operation)
        .bind(workflow.current_operation_name())
        .bind(Json(&workflow.properties))
        .bind(&workflow.error_messages)
        .bind(workflow.date_completed)
        .bind(Json(&workflow.discarded_operations))
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Matching instances ordered by id.
    pub async fn list(
        pool: &PgPool,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflows WHERE {FILTER} ORDER BY id");
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(filter.state.map(WorkflowState::id))
            .bind(&filter.current_operation)
            .bind(&filter.definition_id)
            .bind(filter.parent_id)
            .fetch_all(pool)
            .await
    }

    pub async fn count(pool: &PgPool, filter: &WorkflowFilter) -> Result<i64, sqlx::Error> {
        let query = format!("SELECT COUNT(*) FROM workflows WHERE {FILTER}");
        sqlx::query_scalar::<_, i64>(&query)
            .bind(filter.state.map(WorkflowState::id))
            .bind(&filter.current_operation)
            .bind(&filter.definition_id)
            .bind(filter.parent_id)
            .fetch_one(pool)
            .await
    }

    /// Delete an instance. Returns `true` if a row was removed.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
