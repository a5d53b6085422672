//! Job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: no transitions out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// A non-terminal job still occupies its sequential reference slot.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Any number of jobs for the same reference may run at once.
    #[default]
    Concurrent,
    /// At most one in-flight job per `(reference_type, reference_id)`.
    Sequential,
}

// ============================================================================
// Job model
// ============================================================================

/// A durable, once-executed unit of work with a named handler.
///
/// Rows are owned by the storage backend; this struct is a snapshot.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    // Identity
    pub job_type: String,
    /// Soft link to a domain entity, e.g. `("schedule", name)`. Used for
    /// sequential-mode uniqueness and for routing completion events.
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,

    // Payload
    pub payload: Option<Vec<u8>>,
    /// When set, `payload` is an envelope from the encryption collaborator;
    /// the queue never inspects the plaintext.
    pub payload_encrypted: bool,

    // Scheduling
    pub priority: i32,
    pub execution_mode: ExecutionMode,
    /// Earliest eligible time.
    pub scheduled_for: DateTime<Utc>,

    // Retry
    /// 0-based count of attempts already made.
    pub attempt: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,

    /// Handler return value, recorded on success. Dynamic schedules read
    /// their next run time from here via the completion poll.
    pub result: Option<serde_json::Value>,

    // State
    pub status: JobStatus,
    pub cancel_requested: bool,

    // Ownership
    pub owner_instance_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a pending row from an enqueue spec. Payload bytes are stored
    /// as given; encryption happens in the queue before this is called.
    pub fn from_spec(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            reference_type: spec.reference_type,
            reference_id: spec.reference_id,
            payload: spec.payload,
            payload_encrypted: false,
            priority: spec.priority,
            execution_mode: spec.execution_mode,
            scheduled_for: spec.scheduled_for.unwrap_or(now),
            attempt: 0,
            max_retries: spec.max_retries,
            last_error: None,
            result: None,
            status: JobStatus::Pending,
            cancel_requested: false,
            owner_instance_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether this row may be claimed at `now`, ignoring the sequential
    /// reference guard (which needs visibility of other rows).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && !self.cancel_requested && self.scheduled_for <= now
    }

    /// Whether the lease has lapsed while the job was claimed or running.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Claimed | JobStatus::Running)
            && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// `max_retries = 0` means one attempt, no retries.
    pub fn has_retries_left(&self) -> bool {
        self.attempt < self.max_retries
    }
}

// ============================================================================
// Enqueue spec
// ============================================================================

/// Options for [`crate::jobs::JobQueue::enqueue`].
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    /// Names the handler; must match a registered handler type.
    pub job_type: String,
    #[builder(default)]
    pub payload: Option<Vec<u8>>,
    /// Higher runs first.
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default)]
    pub execution_mode: ExecutionMode,
    #[builder(default = 0)]
    pub max_retries: i32,
    /// Earliest eligible time; now if unset.
    #[builder(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default)]
    pub reference_type: Option<String>,
    #[builder(default)]
    pub reference_id: Option<String>,
    /// Pass the payload through the encryption collaborator before it is
    /// persisted.
    #[builder(default = false)]
    pub encrypt_payload: bool,
}

impl JobSpec {
    /// A plain immediate job with defaults.
    pub fn immediate(job_type: impl Into<String>) -> Self {
        Self::builder().job_type(job_type).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_job() -> Job {
        Job::from_spec(JobSpec::immediate("test_job"))
    }

    #[test]
    fn spec_defaults() {
        let spec = JobSpec::immediate("sync");
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.max_retries, 0);
        assert_eq!(spec.execution_mode, ExecutionMode::Concurrent);
        assert!(!spec.encrypt_payload);
        assert!(spec.scheduled_for.is_none());
    }

    #[test]
    fn new_job_is_pending_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert!(job.owner_instance_id.is_none());
        assert!(job.lease_expires_at.is_none());
    }

    #[test]
    fn scheduled_for_defaults_to_creation_time() {
        let job = sample_job();
        assert!(job.scheduled_for <= Utc::now());
        assert_eq!(job.scheduled_for, job.created_at);
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn claimable_requires_pending_and_due() {
        let now = Utc::now();
        let mut job = sample_job();
        assert!(job.is_claimable(now));

        job.scheduled_for = now + Duration::seconds(30);
        assert!(!job.is_claimable(now));

        job.scheduled_for = now;
        job.cancel_requested = true;
        assert!(!job.is_claimable(now));

        job.cancel_requested = false;
        job.status = JobStatus::Running;
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn due_exactly_now_is_claimable() {
        let now = Utc::now();
        let mut job = sample_job();
        job.scheduled_for = now;
        assert!(job.is_claimable(now));
    }

    #[test]
    fn lease_expiry_only_applies_to_claimed_and_running() {
        let now = Utc::now();
        let mut job = sample_job();
        job.lease_expires_at = Some(now - Duration::seconds(1));
        assert!(!job.lease_expired(now));

        job.status = JobStatus::Running;
        assert!(job.lease_expired(now));

        job.lease_expires_at = Some(now + Duration::seconds(10));
        assert!(!job.lease_expired(now));
    }

    #[test]
    fn zero_max_retries_means_single_attempt() {
        let job = sample_job();
        assert!(!job.has_retries_left());

        let mut retryable = sample_job();
        retryable.max_retries = 2;
        assert!(retryable.has_retries_left());
        retryable.attempt = 2;
        assert!(!retryable.has_retries_left());
    }
}
