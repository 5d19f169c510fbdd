//! Generic operation handlers.

pub mod dispatch;
pub mod hold;

pub use dispatch::DispatchJobHandler;
pub use hold::{HoldDecision, HoldHandler};
