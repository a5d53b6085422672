//! Core lifecycle events.
//!
//! These are facts about jobs and schedules, not commands. Producers
//! publish them on the [`crate::bus::EventBus`] fire-and-forget; the only
//! in-crate consumer is the scheduler, which uses `JobCompleted` to advance
//! sequential and dynamic schedules promptly (its completion poll remains
//! the durable path).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reason string carried by [`SchedulePaused`] when a schedule trips its
/// consecutive-failure ceiling.
pub const REASON_CONSECUTIVE_FAILURES: &str = "consecutive-failures";

/// A job row was persisted and is eligible from `scheduled_for` onwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnqueued {
    pub job_id: Uuid,
    pub job_type: String,
    pub scheduled_for: DateTime<Utc>,
}

/// A claimed job transitioned to running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: Uuid,
    pub job_type: String,
    pub attempt: i32,
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CompletionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionOutcome::Succeeded => f.write_str("succeeded"),
            CompletionOutcome::Failed => f.write_str("failed"),
            CompletionOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A job reached a terminal status. Retries with attempts remaining do not
/// emit this event; the job is still open.
///
/// Carries the job's reference so schedule completions can be routed
/// without a storage read, and the handler's return value so dynamic
/// schedules can pick their next run time from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: Uuid,
    pub job_type: String,
    pub outcome: CompletionOutcome,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// The scheduler emitted a job for a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTriggered {
    pub schedule_name: String,
    pub job_id: Uuid,
}

/// A schedule paused itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePaused {
    pub schedule_name: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_enqueued_serializes() {
        let event = JobEnqueued {
            job_id: Uuid::new_v4(),
            job_type: "code_source_sync".to_string(),
            scheduled_for: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("code_source_sync"));
    }

    #[test]
    fn completion_outcome_uses_snake_case() {
        let json = serde_json::to_string(&CompletionOutcome::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        assert_eq!(CompletionOutcome::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn job_completed_roundtrips() {
        let event = JobCompleted {
            job_id: Uuid::new_v4(),
            job_type: "log_trim".to_string(),
            outcome: CompletionOutcome::Failed,
            reference_type: Some("schedule".to_string()),
            reference_id: Some("trim-logs".to_string()),
            result: None,
            error: Some("disk full".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: JobCompleted = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcome, CompletionOutcome::Failed);
        assert_eq!(back.reference_id.as_deref(), Some("trim-logs"));
        assert_eq!(back.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn schedule_paused_carries_reason() {
        let event = SchedulePaused {
            schedule_name: "key-rotation".to_string(),
            reason: REASON_CONSECUTIVE_FAILURES.to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("consecutive-failures"));
    }
}
