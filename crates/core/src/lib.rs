//! Domain types and pure logic shared by every castflow crate.
//!
//! This crate has zero internal dependencies: the registry, the workflow
//! engine, the persistence layer and the worker binary all build on it.

pub mod error;
pub mod event_types;
pub mod job;
pub mod load_balancing;
pub mod media_package;
pub mod properties;
pub mod registration;
pub mod status;
pub mod store;
pub mod types;
pub mod workflow;
