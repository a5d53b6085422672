//! Job processor.
//!
//! A worker loop that claims eligible jobs, runs the registered handler
//! with a heartbeat at a third of the lease, and records the outcome:
//!
//! ```text
//! claim loop ──► JobQueue.claim_one(registered types)
//!                     │ claimed
//!                     └─► task: start_job ─► handler(payload, token)
//!                              │                   ▲
//!                              │    heartbeat: extend lease +
//!                              │    refresh cancel_requested ──► token
//!                              └─► finish(succeeded | failed | cancelled)
//! ```
//!
//! Handler errors become `failed(message)`; an error that carries
//! [`JobCancelled`] in its chain becomes `cancelled`. A panic or process
//! death leaves the row to orphan reclaim, which this processor also runs
//! periodically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::QueueError;
use crate::jobs::{
    CancelToken, HandlerRegistry, Job, JobCancelled, JobContext, JobOutcome, JobQueue,
};

/// Worker service over a [`JobQueue`] and a [`HandlerRegistry`]. Cheap to
/// clone; clones share one service.
#[derive(Clone)]
pub struct JobProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
    running: AtomicBool,
    running_jobs: RwLock<HashMap<Uuid, CancelToken>>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobProcessor {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(queue, registry, ProcessorConfig::default())
    }

    pub fn with_config(
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                queue,
                registry,
                config,
                running: AtomicBool::new(false),
                running_jobs: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Begin claiming and executing jobs. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let job_types = Arc::new(self.inner.registry.registered_types());
        if job_types.is_empty() {
            warn!("processor started with no registered handlers");
        }

        let shutdown = CancellationToken::new();
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let claim_inner = self.inner.clone();
        let claim_shutdown = shutdown.clone();
        lifecycle.tasks.push(tokio::spawn(async move {
            claim_inner.claim_loop(job_types, claim_shutdown).await;
        }));

        let reclaim_inner = self.inner.clone();
        let reclaim_shutdown = shutdown.clone();
        lifecycle.tasks.push(tokio::spawn(async move {
            // First tick fires immediately: reclaim runs at startup too.
            let mut interval =
                tokio::time::interval(reclaim_inner.config.orphan_reclaim_interval);
            loop {
                tokio::select! {
                    _ = reclaim_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match reclaim_inner.queue.reclaim_orphans().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "orphaned jobs reclaimed"),
                            Err(error) => error!(%error, "orphan reclaim failed"),
                        }
                    }
                }
            }
        }));

        lifecycle.shutdown = Some(shutdown);
        info!(instance = %self.inner.queue.owner(), "job processor started");
    }

    /// Stop claiming and wait up to the configured grace period for
    /// in-flight handlers; whatever is left runs to its lease and is
    /// reclaimed on the next sweep. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (shutdown, tasks) = {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (
                lifecycle.shutdown.take(),
                std::mem::take(&mut lifecycle.tasks),
            )
        };
        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for task in tasks {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let remaining = self.inner.running_jobs.read().await.len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    count = remaining,
                    "shutdown grace elapsed; abandoning leases to orphan reclaim"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        info!("job processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of handlers currently executing.
    pub async fn in_flight(&self) -> usize {
        self.inner.running_jobs.read().await.len()
    }
}

impl ProcessorInner {
    async fn claim_loop(self: &Arc<Self>, job_types: Arc<Vec<String>>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if self.running_jobs.read().await.len() >= self.config.max_concurrency {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(25)) => continue,
                }
            }

            match self.queue.claim_one(&job_types, self.config.lease_ms).await {
                Ok(Some(job)) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.process_job(job).await;
                    });
                    // Claim again right away; the queue may have more due work.
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(error) => {
                    error!(%error, "failed to claim a job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    async fn process_job(self: Arc<Self>, job: Job) {
        let job_id = job.id;
        let token = CancelToken::new();
        self.running_jobs
            .write()
            .await
            .insert(job_id, token.clone());

        self.run_claimed(job, token).await;

        self.running_jobs.write().await.remove(&job_id);
    }

    async fn run_claimed(&self, job: Job, token: CancelToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let job = match self.queue.start_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return, // lease lost between claim and start
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to start job; leaving it to reclaim");
                return;
            }
        };

        let payload = match self.queue.open_payload(&job).await {
            Ok(payload) => payload,
            Err(error) => {
                warn!(job_id = %job_id, %error, "payload unavailable");
                self.finish_with_retry(job_id, JobOutcome::Failed(format!(
                    "payload unavailable: {error}"
                )))
                .await;
                return;
            }
        };

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.queue.clone(),
            job_id,
            token.clone(),
            heartbeat_stop.clone(),
            self.config.lease_ms,
        ));

        debug!(job_id = %job_id, job_type = %job_type, attempt = job.attempt, "executing job");
        let result = self
            .registry
            .execute(JobContext {
                job_id,
                job_type: job_type.clone(),
                attempt: job.attempt,
                payload,
                cancel: token,
            })
            .await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let outcome = match result {
            Ok(value) => JobOutcome::Succeeded(value),
            Err(error) if error.downcast_ref::<JobCancelled>().is_some() => JobOutcome::Cancelled,
            Err(error) => {
                warn!(job_id = %job_id, job_type = %job_type, %error, "handler failed");
                JobOutcome::Failed(error.to_string())
            }
        };
        self.finish_with_retry(job_id, outcome).await;
    }

    /// Renews the lease the job was claimed under at a third of its
    /// duration, so each renewal outlasts the gap to the next beat.
    async fn heartbeat_loop(
        queue: Arc<JobQueue>,
        job_id: Uuid,
        token: CancelToken,
        stop: CancellationToken,
        lease_ms: i64,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_millis((lease_ms / 3).max(1) as u64));
        interval.tick().await; // skip the immediate tick
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(error) = queue.heartbeat(job_id, lease_ms).await {
                        warn!(job_id = %job_id, %error, "heartbeat failed");
                    }
                    match queue.is_cancel_requested(job_id).await {
                        Ok(true) => token.trigger(),
                        Ok(false) => {}
                        Err(error) => warn!(job_id = %job_id, %error, "cancel flag read failed"),
                    }
                }
            }
        }
    }

    /// Storage hiccups on finish are retried with bounded backoff; the
    /// finish itself is idempotent on `(job, outcome)`.
    async fn finish_with_retry(&self, job_id: Uuid, outcome: JobOutcome) {
        const ATTEMPTS: u32 = 3;
        for attempt in 0..ATTEMPTS {
            match self.queue.finish(job_id, outcome.clone()).await {
                Ok(()) => return,
                Err(QueueError::Storage(error)) if attempt + 1 < ATTEMPTS => {
                    warn!(job_id = %job_id, %error, attempt, "finish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
                Err(error) => {
                    error!(job_id = %job_id, %error, "failed to record job outcome");
                    return;
                }
            }
        }
    }
}
