/// Error taxonomy surfaced by the registry, the dispatcher and the workflow
/// engine. None of these are retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A referenced job, registration, definition or workflow does not exist.
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    /// No eligible host is registered for a job type.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The requested transition is not allowed from the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A concurrent writer changed the record first.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CoreError::Validation(errors.to_string())
    }
}
