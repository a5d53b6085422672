//! Persistent schedules.
//!
//! - [`Schedule`] - durable description of when to emit jobs
//! - [`Scheduler`] - tick loop, completion handling, lifecycle API
//! - [`ScheduleStore`] - storage trait with Postgres and in-memory backends

mod memory;
mod postgres;
mod schedule;
mod scheduler;
mod store;

pub use memory::MemoryScheduleStore;
pub use postgres::PostgresScheduleStore;
pub use schedule::{Schedule, ScheduleKind, ScheduleSpec, ScheduleStatus};
pub use scheduler::{dynamic_next_run, Scheduler, SCHEDULE_REFERENCE};
pub use store::ScheduleStore;
