#![allow(dead_code)] // each suite uses a different slice of the harness

//! Shared harness for the integration suites.
//!
//! Everything runs against the in-memory stores with tight loop cadences,
//! so the suites exercise the real tick/claim/completion machinery in
//! hundreds of milliseconds.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    BackoffConfig, EventBus, HandlerRegistry, JobProcessor, JobQueue, MemoryJobStore,
    MemoryScheduleStore, ProcessorConfig, QueueConfig, Scheduler, SchedulerConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(20),
        completion_check_interval: Duration::from_millis(100),
        completion_events: true,
        max_consecutive_failures: 5,
        ..SchedulerConfig::default()
    }
}

pub fn fast_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        poll_interval: Duration::from_millis(10),
        lease_ms: 5_000,
        max_concurrency: 4,
        orphan_reclaim_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(5),
    }
}

/// Backoff short enough that retry paths finish inside a test.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        default_lease_ms: 5_000,
        backoff: BackoffConfig {
            base_ms: 20,
            cap_ms: 60,
            jitter: 0.0,
        },
    }
}

pub struct TestHost {
    pub bus: EventBus,
    pub queue: Arc<JobQueue>,
    pub scheduler: Scheduler,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_scheduler_config(fast_scheduler_config())
    }

    pub fn with_scheduler_config(config: SchedulerConfig) -> Self {
        init_tracing();
        let bus = EventBus::new();
        let queue = Arc::new(
            JobQueue::new(Arc::new(MemoryJobStore::new()), bus.clone())
                .with_config(fast_queue_config()),
        );
        let scheduler = Scheduler::with_config(
            Arc::new(MemoryScheduleStore::new()),
            queue.clone(),
            bus.clone(),
            config,
        );
        Self {
            bus,
            queue,
            scheduler,
        }
    }

    pub fn processor(&self, registry: HandlerRegistry) -> JobProcessor {
        JobProcessor::with_config(
            self.queue.clone(),
            Arc::new(registry),
            fast_processor_config(),
        )
    }
}

/// Poll `check` every 10 ms until it holds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
