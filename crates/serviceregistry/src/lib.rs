//! Job dispatch and the service registry.
//!
//! - [`ServiceRegistry`]: registrations, host capacities, live job counts
//!   and the authoritative job update path.
//! - [`JobDispatcher`]: places a new job on the least loaded eligible
//!   host and delivers it.
//! - [`JobProducer`] / [`MappedJobProducer`]: the worker-side contract
//!   and a handler-map implementation of it.
//! - [`JobTransport`]: how a dispatched job reaches its producer
//!   ([`LocalTransport`], [`HttpTransport`]).
//! - [`JobReaper`]: fails jobs that stop reporting and purges old ones.
//! - [`JobBarrier`]: blocks until jobs reach a terminal status.

pub mod barrier;
pub mod dispatcher;
pub mod producer;
pub mod reaper;
pub mod registry;
pub mod transport;

pub use barrier::JobBarrier;
pub use dispatcher::JobDispatcher;
pub use producer::{operation_fn, panic_message, JobError, JobOperation, JobProducer, MappedJobProducer};
pub use reaper::{JobReaper, ReapReport, RetentionGuard};
pub use registry::ServiceRegistry;
pub use transport::{HttpTransport, JobTransport, LocalTransport, TransportError};
