//! PostgreSQL-backed job store.
//!
//! Claims ride a CTE with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//! contend without blocking and never take the same row. Every other
//! transition is a single conditional `UPDATE ... RETURNING`; an empty
//! result means the guard (status, owner, live lease) no longer held.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::job::Job;
use super::store::JobStore;

const JOB_COLUMNS: &str = "id, job_type, reference_type, reference_id, payload, payload_encrypted, \
     priority, execution_mode, scheduled_for, attempt, max_retries, last_error, result, \
     status, cancel_requested, owner_instance_id, lease_expires_at, \
     created_at, started_at, finished_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(pool: &PgPool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, reference_type, reference_id, payload, payload_encrypted,
                priority, execution_mode, scheduled_for, attempt, max_retries, last_error, result,
                status, cancel_requested, owner_instance_id, lease_expires_at,
                created_at, started_at, finished_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17,
                $18, $19, $20
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.reference_type)
            .bind(&job.reference_id)
            .bind(&job.payload)
            .bind(job.payload_encrypted)
            .bind(job.priority)
            .bind(job.execution_mode)
            .bind(job.scheduled_for)
            .bind(job.attempt)
            .bind(job.max_retries)
            .bind(&job.last_error)
            .bind(&job.result)
            .bind(job.status)
            .bind(job.cancel_requested)
            .bind(&job.owner_instance_id)
            .bind(job.lease_expires_at)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = $1 ORDER BY created_at DESC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(job_type)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn find_by_reference(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE reference_type = $1 AND reference_id = $2 \
             ORDER BY created_at DESC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(reference_type)
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn count_open_sequential(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE reference_type = $1 AND reference_id = $2
              AND execution_mode = 'sequential'
              AND status IN ('pending', 'claimed', 'running')
            "#,
        )
        .bind(reference_type)
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn claim_one(
        &self,
        job_types: &[String],
        owner: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT j.id
                FROM jobs j
                WHERE j.status = 'pending'
                  AND j.job_type = ANY($1)
                  AND j.scheduled_for <= NOW()
                  AND j.cancel_requested = FALSE
                  AND (
                        j.execution_mode <> 'sequential'
                     OR j.reference_type IS NULL
                     OR NOT EXISTS (
                            SELECT 1 FROM jobs other
                            WHERE other.reference_type = j.reference_type
                              AND other.reference_id = j.reference_id
                              AND other.id <> j.id
                              AND other.execution_mode = 'sequential'
                              AND other.status IN ('claimed', 'running')
                        )
                  )
                ORDER BY j.priority DESC, j.scheduled_for ASC, j.created_at ASC, j.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'claimed',
                owner_instance_id = $2,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM candidate)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_types)
            .bind(owner)
            .bind(lease_ms.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn mark_running(&self, id: Uuid, owner: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = NOW()
            WHERE id = $1 AND status = 'claimed'
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn extend_lease(&self, id: Uuid, owner: &str, lease_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = $1 AND status IN ('claimed', 'running')
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(lease_ms.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'succeeded', result = $3, finished_at = NOW(),
                owner_instance_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running'
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(owner)
            .bind(result)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn retry(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'pending', attempt = attempt + 1, scheduled_for = $3, last_error = $4,
                owner_instance_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running'
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(owner)
            .bind(run_at)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn mark_failed(&self, id: Uuid, owner: &str, error: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $3, finished_at = NOW(),
                owner_instance_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running'
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(owner)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn mark_cancelled(&self, id: Uuid, owner: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_at = NOW(),
                owner_instance_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running'
              AND owner_instance_id = $2 AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn cancel_if_pending(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', cancel_requested = TRUE, finished_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE
            WHERE id = $1 AND status IN ('claimed', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        let flag = sqlx::query_scalar::<_, bool>(
            "SELECT cancel_requested FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn reclaim_orphans(&self, error: &str) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'pending', owner_instance_id = NULL, lease_expires_at = NULL,
                last_error = $1
            WHERE status IN ('claimed', 'running') AND lease_expires_at < NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(error)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }
}
