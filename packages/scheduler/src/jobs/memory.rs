//! In-memory job store.
//!
//! Backs the test suites and embedded use. A single write lock around the
//! map is the claim atomicity: every conditional transition happens under
//! the guard, so two concurrent claimers can never take the same row.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::job::{ExecutionMode, Job, JobStatus};
use super::store::JobStore;

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, unordered. Test helper.
    pub fn all(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn owner_holds_live_lease(job: &Job, owner: &str, now: DateTime<Utc>) -> bool {
        job.owner_instance_id.as_deref() == Some(owner)
            && job.lease_expires_at.is_some_and(|at| at > now)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&id).cloned())
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn find_by_reference(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.reference_type.as_deref() == Some(reference_type)
                    && j.reference_id.as_deref() == Some(reference_id)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn count_open_sequential(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<i64> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let count = jobs
            .values()
            .filter(|j| {
                j.status.is_open()
                    && j.execution_mode == ExecutionMode::Sequential
                    && j.reference_type.as_deref() == Some(reference_type)
                    && j.reference_id.as_deref() == Some(reference_id)
            })
            .count();
        Ok(count as i64)
    }

    async fn claim_one(
        &self,
        job_types: &[String],
        owner: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let in_flight: HashSet<(String, String)> = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Claimed | JobStatus::Running)
                    && j.execution_mode == ExecutionMode::Sequential
            })
            .filter_map(|j| Some((j.reference_type.clone()?, j.reference_id.clone()?)))
            .collect();

        let best = jobs
            .values()
            .filter(|j| j.is_claimable(now) && job_types.contains(&j.job_type))
            .filter(|j| {
                if j.execution_mode != ExecutionMode::Sequential {
                    return true;
                }
                match (&j.reference_type, &j.reference_id) {
                    (Some(rt), Some(rid)) => !in_flight.contains(&(rt.clone(), rid.clone())),
                    _ => true,
                }
            })
            .min_by_key(|j| (Reverse(j.priority), j.scheduled_for, j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = best else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate row vanished under lock");
        job.status = JobStatus::Claimed;
        job.owner_instance_id = Some(owner.to_string());
        job.lease_expires_at = Some(now + Duration::milliseconds(lease_ms));
        Ok(Some(job.clone()))
    }

    async fn mark_running(&self, id: Uuid, owner: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Claimed || !Self::owner_holds_live_lease(job, owner, now) {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn extend_lease(&self, id: Uuid, owner: &str, lease_ms: i64) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Claimed | JobStatus::Running)
            || !Self::owner_holds_live_lease(job, owner, now)
        {
            return Ok(false);
        }
        job.lease_expires_at = Some(now + Duration::milliseconds(lease_ms));
        Ok(true)
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !Self::owner_holds_live_lease(job, owner, now) {
            return Ok(None);
        }
        job.status = JobStatus::Succeeded;
        job.result = result;
        job.finished_at = Some(now);
        job.owner_instance_id = None;
        job.lease_expires_at = None;
        Ok(Some(job.clone()))
    }

    async fn retry(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !Self::owner_holds_live_lease(job, owner, now) {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.attempt += 1;
        job.scheduled_for = run_at;
        job.last_error = Some(error.to_string());
        job.owner_instance_id = None;
        job.lease_expires_at = None;
        Ok(Some(job.clone()))
    }

    async fn mark_failed(&self, id: Uuid, owner: &str, error: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !Self::owner_holds_live_lease(job, owner, now) {
            return Ok(None);
        }
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        job.owner_instance_id = None;
        job.lease_expires_at = None;
        Ok(Some(job.clone()))
    }

    async fn mark_cancelled(&self, id: Uuid, owner: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !Self::owner_holds_live_lease(job, owner, now) {
            return Ok(None);
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        job.owner_instance_id = None;
        job.lease_expires_at = None;
        Ok(Some(job.clone()))
    }

    async fn cancel_if_pending(&self, id: Uuid) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Cancelled;
        job.cancel_requested = true;
        job.finished_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(job.status, JobStatus::Claimed | JobStatus::Running) {
            return Ok(None);
        }
        job.cancel_requested = true;
        Ok(Some(job.clone()))
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&id).is_some_and(|j| j.cancel_requested))
    }

    async fn reclaim_orphans(&self, error: &str) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut() {
            if !job.lease_expired(now) {
                continue;
            }
            job.status = JobStatus::Pending;
            job.owner_instance_id = None;
            job.lease_expires_at = None;
            job.last_error = Some(error.to_string());
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }
}
