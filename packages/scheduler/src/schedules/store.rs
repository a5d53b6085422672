//! Storage trait for schedules.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::schedule::{Schedule, ScheduleStatus};

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persist a new schedule. Returns `None` when the name is taken.
    async fn insert(&self, schedule: Schedule) -> Result<Option<Schedule>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>>;

    /// All schedules, optionally filtered by status, ordered by name.
    async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>>;

    /// Full-row update keyed on name. Returns `None` when the row is gone.
    async fn update(&self, schedule: &Schedule) -> Result<Option<Schedule>>;

    /// Full-row update applied only while the stored row still has
    /// `active_job_id = job_id`. Completion handling rides this so the
    /// event path, the poll path, and recovery can race: whoever loses the
    /// condition is a no-op, and a newer in-flight job is never clobbered.
    async fn update_if_tracking(
        &self,
        schedule: &Schedule,
        job_id: Uuid,
    ) -> Result<Option<Schedule>>;

    /// Remove a schedule. Returns whether a row existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Remove every transient row (`is_persistent = false`). Runs before
    /// the first tick on startup.
    async fn delete_transient(&self) -> Result<u64>;

    /// Active schedules with `next_run_at <= now`, excluding
    /// completion-driven schedules that still have a job in flight.
    /// Ordered `(next_run_at ASC, name ASC)`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Every schedule holding an `active_job_id`, regardless of status.
    /// Feeds the completion poll and startup recovery.
    async fn with_active_job(&self) -> Result<Vec<Schedule>>;
}
