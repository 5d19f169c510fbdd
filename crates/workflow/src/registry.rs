//! Operation name to handler lookup.

use std::collections::HashMap;
use std::sync::Arc;

use castflow_core::error::CoreError;

use crate::handler::OperationHandler;

/// Handlers available to the engine, keyed by operation name.
///
/// Built up front and handed to [`WorkflowService::new`](crate::WorkflowService::new);
/// the engine never mutates it.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second handler for the same name is rejected.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), CoreError> {
        let operation = operation.into();
        if self.handlers.contains_key(&operation) {
            return Err(CoreError::IllegalState(format!(
                "A handler for operation '{operation}' is already registered"
            )));
        }
        self.handlers.insert(operation, handler);
        Ok(())
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation).cloned()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
