//! Storage trait for jobs.
//!
//! The store owns the rows and the atomicity of every transition. Workers
//! and the queue stay dumb: each conditional method encodes its own guard
//! ("from this status, by this owner, lease still valid") and returns the
//! updated row, or `None` when the guard no longer held - a stale owner, an
//! expired lease, or a row that already moved on. Callers treat `None` as
//! an idempotent no-op, never as corruption.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::Job;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending row.
    async fn insert(&self, job: Job) -> Result<Job>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// All jobs of a type, newest first.
    async fn find_by_type(&self, job_type: &str) -> Result<Vec<Job>>;

    /// All jobs soft-linked to a domain entity, newest first.
    async fn find_by_reference(&self, reference_type: &str, reference_id: &str)
        -> Result<Vec<Job>>;

    /// Number of non-terminal sequential-mode jobs holding a reference.
    /// Concurrent jobs (e.g. manual triggers) never occupy the slot.
    async fn count_open_sequential(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<i64>;

    /// Atomically claim the single best eligible job.
    ///
    /// Eligibility: pending, `scheduled_for <= now`, not cancel-requested,
    /// type in `job_types`, and - for sequential jobs with a reference - no
    /// other sequential job with the same reference currently claimed or
    /// running.
    /// Ranking: `(priority DESC, scheduled_for ASC, created_at ASC, id ASC)`.
    /// Two concurrent callers must never receive the same row.
    async fn claim_one(&self, job_types: &[String], owner: &str, lease_ms: i64)
        -> Result<Option<Job>>;

    /// `claimed -> running` by the owning instance.
    async fn mark_running(&self, id: Uuid, owner: &str) -> Result<Option<Job>>;

    /// Extend the lease for the owning instance. Returns false when the
    /// caller no longer owns a live lease on the row.
    async fn extend_lease(&self, id: Uuid, owner: &str, lease_ms: i64) -> Result<bool>;

    /// `running -> succeeded`, recording the handler's return value.
    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>>;

    /// `running -> pending` for another attempt: increments `attempt`,
    /// stamps the error, delays until `run_at`, clears ownership.
    async fn retry(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// `running -> failed` (terminal).
    async fn mark_failed(&self, id: Uuid, owner: &str, error: &str) -> Result<Option<Job>>;

    /// `running -> cancelled` (terminal), by the owning instance.
    async fn mark_cancelled(&self, id: Uuid, owner: &str) -> Result<Option<Job>>;

    /// `pending -> cancelled` directly; no owner involved.
    async fn cancel_if_pending(&self, id: Uuid) -> Result<Option<Job>>;

    /// Flag a claimed or running job for cooperative cancellation.
    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>>;

    /// Read the cancellation flag; used by the processor's heartbeat to
    /// refresh handler tokens.
    async fn cancel_requested(&self, id: Uuid) -> Result<bool>;

    /// Reset every claimed/running row whose lease has lapsed back to
    /// pending, preserving `attempt`, clearing ownership, and stamping
    /// `error`. Returns the reclaimed rows.
    async fn reclaim_orphans(&self, error: &str) -> Result<Vec<Job>>;
}
