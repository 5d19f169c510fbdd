//! Process wiring for a castflow host: configuration, the coordinator that
//! owns the registry, dispatcher, workflow service and reaper, and the
//! `castflow-worker` binary.

pub mod config;
pub mod coordinator;

pub use config::{ConfigError, CoordinatorConfig, LogFormat};
pub use coordinator::{Coordinator, Stores, DISPATCH_JOB_OPERATION, HOLD_OPERATION};
