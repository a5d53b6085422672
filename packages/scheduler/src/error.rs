//! Typed errors for the queue and scheduler APIs.
//!
//! Callers get pattern-matchable error kinds (not-found, state, validation,
//! conflict); `anyhow::Error` stays internal to the store implementations
//! and surfaces here only through the `Storage` variants.

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobStatus;

/// Errors surfaced by [`crate::jobs::JobQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The enqueue spec is malformed.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A sequential job for this reference is already open (pending,
    /// claimed, or running).
    #[error("an open sequential job already exists for {reference_type}/{reference_id}")]
    SequentialConflict {
        reference_type: String,
        reference_id: String,
    },

    /// A terminal job was finished again with a different outcome.
    #[error("job {job_id} is already {status}")]
    AlreadyFinished { job_id: Uuid, status: JobStatus },

    /// Payload encryption was requested (or an encrypted payload was read)
    /// with no cipher configured.
    #[error("payload is encrypted but no cipher is configured")]
    MissingCipher,

    /// The storage backend failed after bounded retries.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors surfaced by [`crate::schedules::Scheduler`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The named schedule does not exist.
    #[error("schedule {0} not found")]
    NotFound(String),

    /// A schedule with this name already exists. Registration is not
    /// idempotent by design.
    #[error("schedule {0} already exists")]
    Duplicate(String),

    /// The registration spec is malformed.
    #[error("invalid schedule config: {0}")]
    InvalidConfig(String),

    /// The requested lifecycle transition is not legal from the schedule's
    /// current status.
    #[error("schedule {name}: {reason}")]
    IllegalTransition { name: String, reason: String },

    /// The storage backend failed after bounded retries.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<QueueError> for ScheduleError {
    fn from(err: QueueError) -> Self {
        ScheduleError::Storage(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_are_pattern_matchable() {
        let err = QueueError::SequentialConflict {
            reference_type: "schedule".into(),
            reference_id: "trim-logs".into(),
        };
        match err {
            QueueError::SequentialConflict { reference_id, .. } => {
                assert_eq!(reference_id, "trim-logs");
            }
            _ => panic!("expected SequentialConflict"),
        }
    }

    #[test]
    fn not_found_displays_the_id() {
        let id = Uuid::new_v4();
        assert!(QueueError::NotFound(id).to_string().contains(&id.to_string()));
        assert!(ScheduleError::NotFound("sync".into())
            .to_string()
            .contains("sync"));
    }

    #[test]
    fn storage_variant_wraps_anyhow() {
        let err: QueueError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn illegal_transition_names_the_schedule() {
        let err = ScheduleError::IllegalTransition {
            name: "rollup".into(),
            reason: "already paused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("rollup"));
        assert!(text.contains("already paused"));
    }
}
