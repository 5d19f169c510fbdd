pub mod job;
pub mod workflow;
