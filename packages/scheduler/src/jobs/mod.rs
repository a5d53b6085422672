//! Durable job queue.
//!
//! - [`Job`] - the durable unit of work and its state machine
//! - [`JobQueue`] - service layer: enqueue, claim, heartbeat, finish,
//!   cancel, orphan reclaim
//! - [`JobStore`] - storage trait with Postgres and in-memory backends
//! - [`HandlerRegistry`] - job-type to handler mapping used by the processor
//! - [`CancelToken`] - cooperative cancellation handed to handlers

mod cancel;
mod job;
mod memory;
mod postgres;
mod queue;
mod registry;
mod store;

pub use cancel::{CancelToken, JobCancelled};
pub use job::{ExecutionMode, Job, JobSpec, JobStatus};
pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;
pub use queue::{JobOutcome, JobQueue};
pub use registry::{HandlerRegistry, JobContext};
pub use store::JobStore;
