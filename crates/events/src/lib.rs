//! castflow event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`DomainEvent`]: the event envelope for job, registration and
//!   workflow changes.
//! - [`watch`]: helpers for awaiting a specific event.

pub mod bus;
pub mod watch;

pub use bus::{DomainEvent, EventBus};
pub use watch::wait_for_event;
