//! PostgreSQL-backed schedule store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::schedule::{Schedule, ScheduleStatus};
use super::store::ScheduleStore;

const SCHEDULE_COLUMNS: &str = "name, description, kind, status, next_run_at, interval_ms, \
     job_type, job_payload, job_priority, job_max_retries, is_persistent, \
     consecutive_failures, max_consecutive_failures, active_job_id, \
     last_completed_at, last_failed_at, created_at, updated_at";

pub struct PostgresScheduleStore {
    pool: PgPool,
}

impl PostgresScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn insert(&self, schedule: Schedule) -> Result<Option<Schedule>> {
        let sql = format!(
            r#"
            INSERT INTO schedules (
                name, description, kind, status, next_run_at, interval_ms,
                job_type, job_payload, job_priority, job_max_retries, is_persistent,
                consecutive_failures, max_consecutive_failures, active_job_id,
                last_completed_at, last_failed_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11,
                $12, $13, $14,
                $15, $16, $17, $18
            )
            ON CONFLICT (name) DO NOTHING
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Schedule>(&sql)
            .bind(&schedule.name)
            .bind(&schedule.description)
            .bind(schedule.kind)
            .bind(schedule.status)
            .bind(schedule.next_run_at)
            .bind(schedule.interval_ms)
            .bind(&schedule.job_type)
            .bind(&schedule.job_payload)
            .bind(schedule.job_priority)
            .bind(schedule.job_max_retries)
            .bind(schedule.is_persistent)
            .bind(schedule.consecutive_failures)
            .bind(schedule.max_consecutive_failures)
            .bind(schedule.active_job_id)
            .bind(schedule.last_completed_at)
            .bind(schedule.last_failed_at)
            .bind(schedule.created_at)
            .bind(schedule.updated_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE name = $1");
        let schedule = sqlx::query_as::<_, Schedule>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(schedule)
    }

    async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>> {
        let schedules = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE status = $1 ORDER BY name"
                );
                sqlx::query_as::<_, Schedule>(&sql)
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name");
                sqlx::query_as::<_, Schedule>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(schedules)
    }

    async fn update(&self, schedule: &Schedule) -> Result<Option<Schedule>> {
        let sql = format!(
            r#"
            UPDATE schedules SET
                description = $2, kind = $3, status = $4, next_run_at = $5, interval_ms = $6,
                job_type = $7, job_payload = $8, job_priority = $9, job_max_retries = $10,
                is_persistent = $11, consecutive_failures = $12, max_consecutive_failures = $13,
                active_job_id = $14, last_completed_at = $15, last_failed_at = $16,
                updated_at = NOW()
            WHERE name = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Schedule>(&sql)
            .bind(&schedule.name)
            .bind(&schedule.description)
            .bind(schedule.kind)
            .bind(schedule.status)
            .bind(schedule.next_run_at)
            .bind(schedule.interval_ms)
            .bind(&schedule.job_type)
            .bind(&schedule.job_payload)
            .bind(schedule.job_priority)
            .bind(schedule.job_max_retries)
            .bind(schedule.is_persistent)
            .bind(schedule.consecutive_failures)
            .bind(schedule.max_consecutive_failures)
            .bind(schedule.active_job_id)
            .bind(schedule.last_completed_at)
            .bind(schedule.last_failed_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(updated)
    }

    async fn update_if_tracking(
        &self,
        schedule: &Schedule,
        job_id: uuid::Uuid,
    ) -> Result<Option<Schedule>> {
        let sql = format!(
            r#"
            UPDATE schedules SET
                description = $2, kind = $3, status = $4, next_run_at = $5, interval_ms = $6,
                job_type = $7, job_payload = $8, job_priority = $9, job_max_retries = $10,
                is_persistent = $11, consecutive_failures = $12, max_consecutive_failures = $13,
                active_job_id = $14, last_completed_at = $15, last_failed_at = $16,
                updated_at = NOW()
            WHERE name = $1 AND active_job_id = $17
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Schedule>(&sql)
            .bind(&schedule.name)
            .bind(&schedule.description)
            .bind(schedule.kind)
            .bind(schedule.status)
            .bind(schedule.next_run_at)
            .bind(schedule.interval_ms)
            .bind(&schedule.job_type)
            .bind(&schedule.job_payload)
            .bind(schedule.job_priority)
            .bind(schedule.job_max_retries)
            .bind(schedule.is_persistent)
            .bind(schedule.consecutive_failures)
            .bind(schedule.max_consecutive_failures)
            .bind(schedule.active_job_id)
            .bind(schedule.last_completed_at)
            .bind(schedule.last_failed_at)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_transient(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM schedules WHERE is_persistent = FALSE")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let sql = format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM schedules
            WHERE status = 'active'
              AND next_run_at IS NOT NULL
              AND next_run_at <= $1
              AND (kind IN ('one_off', 'concurrent_interval') OR active_job_id IS NULL)
            ORDER BY next_run_at ASC, name ASC
            "#
        );
        let schedules = sqlx::query_as::<_, Schedule>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(schedules)
    }

    async fn with_active_job(&self) -> Result<Vec<Schedule>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE active_job_id IS NOT NULL ORDER BY name"
        );
        let schedules = sqlx::query_as::<_, Schedule>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(schedules)
    }
}
