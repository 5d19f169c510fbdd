//! Workflow engine: runs the operations of a workflow instance one at a
//! time over its media package, with durable pause and resume.
//!
//! - [`OperationHandler`] / [`ResumableOperationHandler`]: pluggable step
//!   logic.
//! - [`HandlerRegistry`]: operation name to handler.
//! - [`WorkflowService`]: definitions, instance lifecycle and the
//!   per-instance runner.
//! - [`handlers`]: generic handlers for dispatching jobs and holding for
//!   external input.

pub mod handler;
pub mod handlers;
pub mod registry;
pub mod service;

pub use handler::{
    Action, HoldInput, OperationError, OperationHandler, OperationResult,
    ResumableOperationHandler,
};
pub use registry::HandlerRegistry;
pub use service::{WorkflowService, DEFAULT_CONCURRENCY};
