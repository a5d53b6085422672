//! Job queue service.
//!
//! The queue owns everything above the storage rows: spec validation,
//! payload encryption, claim leases, the retry/terminal split on finish,
//! cooperative cancellation, orphan reclaim, and event emission. All
//! mutable state lives in the [`JobStore`]; this type is freely shareable.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::QueueConfig;
use crate::crypto::PayloadCipher;
use crate::error::QueueError;
use crate::events::{CompletionOutcome, JobCompleted, JobEnqueued, JobStarted};
use crate::instance::InstanceId;

use super::job::{ExecutionMode, Job, JobSpec, JobStatus};
use super::store::JobStore;

/// Terminal outcome reported by a worker through [`JobQueue::finish`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Handler returned, optionally with a JSON-serialisable value.
    Succeeded(Option<serde_json::Value>),
    /// Handler failed with an error message. Retries until attempts are
    /// exhausted, then becomes terminal.
    Failed(String),
    /// Handler observed its cancellation token.
    Cancelled,
}

impl JobOutcome {
    fn completion(&self) -> CompletionOutcome {
        match self {
            JobOutcome::Succeeded(_) => CompletionOutcome::Succeeded,
            JobOutcome::Failed(_) => CompletionOutcome::Failed,
            JobOutcome::Cancelled => CompletionOutcome::Cancelled,
        }
    }

    /// Whether a terminal row already carries this outcome; used to make a
    /// repeated `finish` a no-op.
    fn matches(&self, status: JobStatus) -> bool {
        matches!(
            (self, status),
            (JobOutcome::Succeeded(_), JobStatus::Succeeded)
                | (JobOutcome::Failed(_), JobStatus::Failed)
                | (JobOutcome::Cancelled, JobStatus::Cancelled)
        )
    }
}

/// Durable priority queue with claim leases and crash recovery.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    bus: EventBus,
    cipher: Option<Arc<dyn PayloadCipher>>,
    config: QueueConfig,
    owner: String,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            cipher: None,
            config: QueueConfig::default(),
            owner: InstanceId::current().id().to_string(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the encryption collaborator. Without one, enqueueing with
    /// `encrypt_payload` and reading encrypted payloads are rejected.
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Override the owner token. Tests use this to simulate several
    /// instances against one store.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn default_lease_ms(&self) -> i64 {
        self.config.default_lease_ms
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job, QueueError> {
        if spec.job_type.trim().is_empty() {
            return Err(QueueError::InvalidSpec("job_type must not be empty".into()));
        }
        if spec.max_retries < 0 {
            return Err(QueueError::InvalidSpec(
                "max_retries must not be negative".into(),
            ));
        }
        if spec.reference_type.is_some() != spec.reference_id.is_some() {
            return Err(QueueError::InvalidSpec(
                "reference_type and reference_id must be set together".into(),
            ));
        }

        // Sequential jobs keep the at-most-one-open invariant per reference.
        if spec.execution_mode == ExecutionMode::Sequential {
            if let (Some(rt), Some(rid)) = (&spec.reference_type, &spec.reference_id) {
                if self.store.count_open_sequential(rt, rid).await? > 0 {
                    return Err(QueueError::SequentialConflict {
                        reference_type: rt.clone(),
                        reference_id: rid.clone(),
                    });
                }
            }
        }

        let encrypt = spec.encrypt_payload;
        let mut job = Job::from_spec(spec);
        if encrypt {
            if let Some(plaintext) = job.payload.take() {
                let cipher = self.cipher.as_ref().ok_or(QueueError::MissingCipher)?;
                job.payload = Some(cipher.encrypt(&plaintext).await?);
                job.payload_encrypted = true;
            }
        }

        let job = self.store.insert(job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, scheduled_for = %job.scheduled_for, "job enqueued");
        self.bus.publish(JobEnqueued {
            job_id: job.id,
            job_type: job.job_type.clone(),
            scheduled_for: job.scheduled_for,
        });
        Ok(job)
    }

    // ========================================================================
    // Worker surface
    // ========================================================================

    /// Claim the single best eligible job of one of `job_types`, stamping
    /// this instance as owner for `lease_ms`.
    pub async fn claim_one(
        &self,
        job_types: &[String],
        lease_ms: i64,
    ) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim_one(job_types, &self.owner, lease_ms).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "job claimed");
        }
        Ok(job)
    }

    /// `claimed -> running`; emits `JobStarted`. Returns `None` when the
    /// lease was lost in the meantime.
    pub async fn start_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let Some(job) = self.store.mark_running(job_id, &self.owner).await? else {
            debug!(job_id = %job_id, "start ignored: lease no longer held");
            return Ok(None);
        };
        self.bus.publish(JobStarted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempt,
        });
        Ok(Some(job))
    }

    /// Extend this instance's lease by `lease_ms` - the same duration the
    /// job was claimed under, so every renewal outlasts the gap to the next
    /// heartbeat. Returns false (and logs at debug) when the lease is no
    /// longer held; per the lease discipline that is a silent no-op, not an
    /// error.
    pub async fn heartbeat(&self, job_id: Uuid, lease_ms: i64) -> Result<bool, QueueError> {
        let extended = self.store.extend_lease(job_id, &self.owner, lease_ms).await?;
        if !extended {
            debug!(job_id = %job_id, "heartbeat ignored: lease no longer held");
        }
        Ok(extended)
    }

    /// Record a terminal outcome (or schedule a retry for a failure with
    /// attempts remaining).
    ///
    /// Idempotent for the owner: repeating a finish with the outcome the
    /// row already carries is a no-op. A write after the lease lapsed is
    /// also a no-op, logged at debug - the row now belongs to whoever
    /// reclaimed it.
    pub async fn finish(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), QueueError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;

        if job.status.is_terminal() {
            if outcome.matches(job.status) {
                debug!(job_id = %job_id, status = %job.status, "finish replayed, no-op");
                return Ok(());
            }
            return Err(QueueError::AlreadyFinished {
                job_id,
                status: job.status,
            });
        }

        let updated = match &outcome {
            JobOutcome::Succeeded(result) => {
                self.store
                    .mark_succeeded(job_id, &self.owner, result.clone())
                    .await?
            }
            JobOutcome::Failed(error) => {
                if job.has_retries_left() {
                    let delay = self.config.backoff.delay_ms(job.attempt);
                    let run_at = Utc::now() + Duration::milliseconds(delay);
                    match self.store.retry(job_id, &self.owner, error, run_at).await? {
                        Some(retried) => {
                            info!(
                                job_id = %job_id,
                                attempt = retried.attempt,
                                max_retries = retried.max_retries,
                                run_at = %run_at,
                                error = %error,
                                "job failed, retry scheduled"
                            );
                            return Ok(());
                        }
                        None => None,
                    }
                } else {
                    self.store.mark_failed(job_id, &self.owner, error).await?
                }
            }
            JobOutcome::Cancelled => self.store.mark_cancelled(job_id, &self.owner).await?,
        };

        let Some(job) = updated else {
            debug!(job_id = %job_id, "finish ignored: lease no longer held");
            return Ok(());
        };

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            outcome = %outcome.completion(),
            "job finished"
        );
        self.publish_completed(&job, &outcome);
        Ok(())
    }

    fn publish_completed(&self, job: &Job, outcome: &JobOutcome) {
        let (result, error) = match outcome {
            JobOutcome::Succeeded(result) => (result.clone(), None),
            JobOutcome::Failed(error) => (None, Some(error.clone())),
            JobOutcome::Cancelled => (None, None),
        };
        self.bus.publish(JobCompleted {
            job_id: job.id,
            job_type: job.job_type.clone(),
            outcome: outcome.completion(),
            reference_type: job.reference_type.clone(),
            reference_id: job.reference_id.clone(),
            result,
            error,
        });
    }

    // ========================================================================
    // Cancellation and recovery
    // ========================================================================

    /// Request cancellation. A pending job is cancelled on the spot; a
    /// claimed or running job gets its flag set for the owner to observe
    /// cooperatively. A terminal job is left alone.
    pub async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        if let Some(job) = self.store.cancel_if_pending(job_id).await? {
            info!(job_id = %job_id, "pending job cancelled");
            self.publish_completed(&job, &JobOutcome::Cancelled);
            return Ok(());
        }
        if self.store.request_cancel(job_id).await?.is_some() {
            info!(job_id = %job_id, "cancellation requested for in-flight job");
            return Ok(());
        }
        // Neither pending nor in flight: distinguish missing from terminal.
        match self.store.find_by_id(job_id).await? {
            Some(job) => {
                debug!(job_id = %job_id, status = %job.status, "cancel request ignored for terminal job");
                Ok(())
            }
            None => Err(QueueError::NotFound(job_id)),
        }
    }

    /// Reset every job whose lease lapsed back to pending, preserving its
    /// attempt count. Jobs that were flagged for cancellation while
    /// orphaned are finalised as cancelled instead of re-queued.
    pub async fn reclaim_orphans(&self) -> Result<u64, QueueError> {
        let reclaimed = self.store.reclaim_orphans("lease expired").await?;
        let count = reclaimed.len() as u64;
        for job in reclaimed {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt,
                "orphaned job reclaimed"
            );
            if job.cancel_requested {
                if let Some(cancelled) = self.store.cancel_if_pending(job.id).await? {
                    self.publish_completed(&cancelled, &JobOutcome::Cancelled);
                }
            }
        }
        Ok(count)
    }

    // ========================================================================
    // Read queries
    // ========================================================================

    pub async fn get(&self, job_id: Uuid) -> Result<Job, QueueError> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    pub async fn get_by_type(&self, job_type: &str) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.find_by_type(job_type).await?)
    }

    pub async fn get_jobs_by_reference(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .store
            .find_by_reference(reference_type, reference_id)
            .await?)
    }

    /// Check a job's cancellation flag; the processor's heartbeat calls
    /// this to refresh handler tokens.
    pub async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.store.cancel_requested(job_id).await?)
    }

    /// The job's payload as the handler should see it: decrypted when it
    /// was stored encrypted.
    pub async fn open_payload(&self, job: &Job) -> Result<Option<Vec<u8>>, QueueError> {
        match &job.payload {
            None => Ok(None),
            Some(bytes) if !job.payload_encrypted => Ok(Some(bytes.clone())),
            Some(envelope) => {
                let cipher = self.cipher.as_ref().ok_or(QueueError::MissingCipher)?;
                Ok(Some(cipher.decrypt(envelope).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryJobStore;
    use crate::testing::StaticEnvelopeCipher;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryJobStore::new()), EventBus::new())
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn claim_and_run(queue: &JobQueue, job_type: &str) -> Job {
        let job = queue
            .claim_one(&types(&[job_type]), 60_000)
            .await
            .unwrap()
            .expect("expected a claimable job");
        queue.start_job(job.id).await.unwrap().expect("lease held")
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_job_type() {
        let err = queue().enqueue(JobSpec::immediate("  ")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_half_set_reference() {
        let spec = JobSpec::builder()
            .job_type("t")
            .reference_type(Some("schedule".to_string()))
            .build();
        let err = queue().enqueue(spec).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn sequential_duplicate_reference_conflicts() {
        let queue = queue();
        let spec = || {
            JobSpec::builder()
                .job_type("t")
                .execution_mode(ExecutionMode::Sequential)
                .reference_type(Some("schedule".to_string()))
                .reference_id(Some("s1".to_string()))
                .build()
        };
        queue.enqueue(spec()).await.unwrap();
        let err = queue.enqueue(spec()).await.unwrap_err();
        assert!(matches!(err, QueueError::SequentialConflict { .. }));
    }

    #[tokio::test]
    async fn encrypt_without_cipher_is_rejected() {
        let spec = JobSpec::builder()
            .job_type("t")
            .payload(Some(b"secret".to_vec()))
            .encrypt_payload(true)
            .build();
        let err = queue().enqueue(spec).await.unwrap_err();
        assert!(matches!(err, QueueError::MissingCipher));
    }

    #[tokio::test]
    async fn encrypted_payload_round_trips() {
        let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), EventBus::new())
            .with_cipher(Arc::new(StaticEnvelopeCipher::new()));
        let spec = JobSpec::builder()
            .job_type("t")
            .payload(Some(b"secret bytes".to_vec()))
            .encrypt_payload(true)
            .build();
        let job = queue.enqueue(spec).await.unwrap();

        assert!(job.payload_encrypted);
        assert_ne!(job.payload.as_deref(), Some(b"secret bytes".as_slice()));
        let opened = queue.open_payload(&job).await.unwrap();
        assert_eq!(opened.as_deref(), Some(b"secret bytes".as_slice()));
    }

    #[tokio::test]
    async fn finish_failed_with_retries_repends_same_row() {
        let queue = queue();
        let job = queue
            .enqueue(JobSpec::builder().job_type("t").max_retries(2).build())
            .await
            .unwrap();
        let running = claim_and_run(&queue, "t").await;
        assert_eq!(running.id, job.id);

        queue
            .finish(job.id, JobOutcome::Failed("boom".into()))
            .await
            .unwrap();

        let row = queue.get(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.attempt, 1);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
        assert!(row.owner_instance_id.is_none());
        assert!(row.scheduled_for > Utc::now(), "retry is delayed by backoff");
    }

    #[tokio::test]
    async fn finish_failed_without_retries_is_terminal() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        claim_and_run(&queue, "t").await;

        queue
            .finish(job.id, JobOutcome::Failed("boom".into()))
            .await
            .unwrap();
        let row = queue.get(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn finish_is_idempotent_for_same_outcome() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        claim_and_run(&queue, "t").await;

        queue
            .finish(job.id, JobOutcome::Succeeded(None))
            .await
            .unwrap();
        queue
            .finish(job.id, JobOutcome::Succeeded(None))
            .await
            .unwrap();

        let err = queue
            .finish(job.id, JobOutcome::Failed("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyFinished { .. }));
    }

    #[tokio::test]
    async fn stale_owner_finish_is_a_silent_noop() {
        let store = Arc::new(MemoryJobStore::new());
        let bus = EventBus::new();
        let owner_a = JobQueue::new(store.clone(), bus.clone()).with_owner("a");
        let owner_b = JobQueue::new(store, bus).with_owner("b");

        let job = owner_a.enqueue(JobSpec::immediate("t")).await.unwrap();
        claim_and_run(&owner_a, "t").await;

        // A different instance never owned the lease; its write is dropped.
        owner_b
            .finish(job.id, JobOutcome::Succeeded(None))
            .await
            .unwrap();
        assert_eq!(owner_b.get(job.id).await.unwrap().status, JobStatus::Running);

        assert!(!owner_b.heartbeat(job.id, 60_000).await.unwrap());
        assert!(owner_a.heartbeat(job.id, 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_pending_job_is_immediate() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        queue.request_cancel(job.id).await.unwrap();

        let row = queue.get(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);

        // Terminal: a repeat request is a no-op, not an error.
        queue.request_cancel(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_running_job_sets_flag_only() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        claim_and_run(&queue, "t").await;

        queue.request_cancel(job.id).await.unwrap();
        let row = queue.get(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Running);
        assert!(row.cancel_requested);
        assert!(queue.is_cancel_requested(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let err = queue().request_cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn reclaim_finalises_cancel_requested_orphans() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        queue
            .claim_one(&types(&["t"]), 10)
            .await
            .unwrap()
            .expect("claimed");
        queue.start_job(job.id).await.unwrap();
        queue.request_cancel(job.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let count = queue.reclaim_orphans().await.unwrap();
        assert_eq!(count, 1);
        let row = queue.get(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn max_retries_zero_means_one_attempt() {
        let queue = queue();
        let job = queue.enqueue(JobSpec::immediate("t")).await.unwrap();
        claim_and_run(&queue, "t").await;
        queue
            .finish(job.id, JobOutcome::Failed("once".into()))
            .await
            .unwrap();

        assert_eq!(queue.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert!(queue
            .claim_one(&types(&["t"]), 60_000)
            .await
            .unwrap()
            .is_none());
    }
}
