//! Scheduling and job-queue core for the function host.
//!
//! This crate is the persistent engine behind all recurring and deferred
//! work: a durable job queue with priority, retries, and ownership leases, a
//! schedule layer that emits jobs at the right time, and a worker loop that
//! executes registered handlers.
//!
//! # Architecture
//!
//! ```text
//! Caller registers a Schedule ──► Scheduler tick loop
//!                                      │ due schedules
//!                                      └─► JobQueue.enqueue ──► jobs table
//! Caller enqueues a Job ──────────────────────┘
//!
//! JobProcessor
//!     │
//!     ├─► JobQueue.claim_one (owner = InstanceId, bounded lease)
//!     ├─► HandlerRegistry.execute(payload, CancelToken)
//!     └─► JobQueue.finish ──► JobCompleted on the EventBus
//!                                      │
//!                                      └─► Scheduler completion handling
//!                                          (sequential/dynamic advancement)
//! ```
//!
//! All durable state lives in the storage backend behind the [`JobStore`]
//! and [`ScheduleStore`] traits; components hold ids and snapshots, never
//! shared mutable object graphs. Postgres implementations ship alongside
//! in-memory ones (the latter back the test suites and embedded use).

pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod instance;
pub mod jobs;
pub mod processor;
pub mod schedules;
pub mod testing;

pub use bus::{EventBus, Subscription};
pub use config::{BackoffConfig, CatchUpPolicy, ProcessorConfig, QueueConfig, SchedulerConfig};
pub use crypto::PayloadCipher;
pub use error::{QueueError, ScheduleError};
pub use events::{
    CompletionOutcome, JobCompleted, JobEnqueued, JobStarted, SchedulePaused, ScheduleTriggered,
};
pub use instance::InstanceId;
pub use jobs::{
    CancelToken, ExecutionMode, HandlerRegistry, Job, JobCancelled, JobContext, JobOutcome,
    JobQueue, JobSpec, JobStatus, JobStore, MemoryJobStore, PostgresJobStore,
};
pub use processor::JobProcessor;
pub use schedules::{
    dynamic_next_run, MemoryScheduleStore, PostgresScheduleStore, Schedule, ScheduleKind,
    ScheduleSpec, ScheduleStatus, ScheduleStore, Scheduler,
};
