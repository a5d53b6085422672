//! Schedule model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::CatchUpPolicy;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fires once at `next_run_at`, then completes.
    OneOff,
    /// Fires every interval regardless of whether the previous job
    /// finished.
    ConcurrentInterval,
    /// Fires only after the previous job reached a terminal status;
    /// `next_run_at` is then `completion + interval`.
    SequentialInterval,
    /// Like sequential, but the handler's return value supplies the next
    /// run time; no value completes the schedule.
    Dynamic,
}

impl ScheduleKind {
    /// Interval kinds require `interval_ms` at registration.
    pub fn is_interval(&self) -> bool {
        matches!(
            self,
            ScheduleKind::ConcurrentInterval | ScheduleKind::SequentialInterval
        )
    }

    /// Kinds that serialise their jobs and advance on completion.
    pub fn is_completion_driven(&self) -> bool {
        matches!(self, ScheduleKind::SequentialInterval | ScheduleKind::Dynamic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::OneOff => "one_off",
            ScheduleKind::ConcurrentInterval => "concurrent_interval",
            ScheduleKind::SequentialInterval => "sequential_interval",
            ScheduleKind::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "schedule_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Active,
    Paused,
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Schedule model
// ============================================================================

/// A durable description of when to emit jobs. Rows are owned by the
/// storage backend; this struct is a snapshot.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub description: Option<String>,
    pub kind: ScheduleKind,
    pub status: ScheduleStatus,

    // Timing
    pub next_run_at: Option<DateTime<Utc>>,
    pub interval_ms: Option<i64>,

    // Job template
    pub job_type: String,
    pub job_payload: Option<Vec<u8>>,
    pub job_priority: Option<i32>,
    pub job_max_retries: Option<i32>,

    /// Transient schedules (`false`) are deleted on process startup.
    pub is_persistent: bool,

    // Failure tracking
    pub consecutive_failures: i32,
    pub max_consecutive_failures: i32,

    /// The in-flight job for sequential/dynamic kinds; an id, never a
    /// reference.
    pub active_job_id: Option<Uuid>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::milliseconds)
    }

    /// Due means `next_run_at <= now`; a schedule with no next run never
    /// fires.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active && self.next_run_at.is_some_and(|at| at <= now)
    }
}

/// Next fire time for an interval schedule that just fired at `prev`.
///
/// Drift-free keeps the original cadence and, when the process fell behind
/// by one interval or more, skips the missed fires straight to the smallest
/// future multiple - catch-up, never a burst.
pub(crate) fn advance_interval(
    prev: DateTime<Utc>,
    interval_ms: i64,
    now: DateTime<Utc>,
    policy: CatchUpPolicy,
) -> DateTime<Utc> {
    match policy {
        CatchUpPolicy::Reset => now + Duration::milliseconds(interval_ms),
        CatchUpPolicy::DriftFree => {
            let mut next = prev + Duration::milliseconds(interval_ms);
            if next <= now {
                let behind_ms = (now - prev).num_milliseconds();
                let steps = behind_ms / interval_ms + 1;
                next = prev + Duration::milliseconds(interval_ms * steps);
                if next <= now {
                    next += Duration::milliseconds(interval_ms);
                }
            }
            next
        }
    }
}

// ============================================================================
// Registration spec
// ============================================================================

/// Options for [`crate::schedules::Scheduler::register_schedule`].
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleSpec {
    /// Unique schedule name; also the `reference_id` on emitted jobs.
    pub name: String,
    #[builder(default)]
    pub description: Option<String>,
    pub kind: ScheduleKind,
    /// Required for one-off and dynamic kinds; derived for intervals when
    /// unset.
    #[builder(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Required (> 0) for the interval kinds.
    #[builder(default)]
    pub interval_ms: Option<i64>,
    pub job_type: String,
    #[builder(default)]
    pub job_payload: Option<Vec<u8>>,
    #[builder(default)]
    pub job_priority: Option<i32>,
    #[builder(default)]
    pub job_max_retries: Option<i32>,
    /// Transient schedules (`false`) vanish on restart; callers get
    /// ephemeral periodic tasks without cleanup bookkeeping.
    #[builder(default = true)]
    pub persistent: bool,
    /// Failure ceiling before self-pause; the scheduler default applies
    /// when unset.
    #[builder(default)]
    pub max_consecutive_failures: Option<i32>,
}
