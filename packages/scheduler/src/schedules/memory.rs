//! In-memory schedule store.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::schedule::{Schedule, ScheduleStatus};
use super::store::ScheduleStore;

#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: Schedule) -> Result<Option<Schedule>> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        if schedules.contains_key(&schedule.name) {
            return Ok(None);
        }
        schedules.insert(schedule.name.clone(), schedule.clone());
        Ok(Some(schedule))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.get(name).cloned())
    }

    async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Schedule> = schedules
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn update(&self, schedule: &Schedule) -> Result<Option<Schedule>> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        if !schedules.contains_key(&schedule.name) {
            return Ok(None);
        }
        let mut updated = schedule.clone();
        updated.updated_at = Utc::now();
        schedules.insert(updated.name.clone(), updated.clone());
        Ok(Some(updated))
    }

    async fn update_if_tracking(
        &self,
        schedule: &Schedule,
        job_id: uuid::Uuid,
    ) -> Result<Option<Schedule>> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        match schedules.get(&schedule.name) {
            Some(current) if current.active_job_id == Some(job_id) => {
                let mut updated = schedule.clone();
                updated.updated_at = Utc::now();
                schedules.insert(updated.name.clone(), updated.clone());
                Ok(Some(updated))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.remove(name).is_some())
    }

    async fn delete_transient(&self) -> Result<u64> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        let before = schedules.len();
        schedules.retain(|_, s| s.is_persistent);
        Ok((before - schedules.len()) as u64)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.is_due(now))
            .filter(|s| !s.kind.is_completion_driven() || s.active_job_id.is_none())
            .cloned()
            .collect();
        found.sort_by(|a, b| (a.next_run_at, &a.name).cmp(&(b.next_run_at, &b.name)));
        Ok(found)
    }

    async fn with_active_job(&self) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.active_job_id.is_some())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedules::schedule::ScheduleKind;
    use chrono::Duration;
    use uuid::Uuid;

    fn sample(name: &str, kind: ScheduleKind, next: Option<DateTime<Utc>>) -> Schedule {
        let now = Utc::now();
        Schedule {
            name: name.to_string(),
            description: None,
            kind,
            status: ScheduleStatus::Active,
            next_run_at: next,
            interval_ms: Some(1_000),
            job_type: "t".to_string(),
            job_payload: None,
            job_priority: None,
            job_max_retries: None,
            is_persistent: true,
            consecutive_failures: 0,
            max_consecutive_failures: 5,
            active_job_id: None,
            last_completed_at: None,
            last_failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_names() {
        let store = MemoryScheduleStore::new();
        let schedule = sample("s1", ScheduleKind::OneOff, None);
        assert!(store.insert(schedule.clone()).await.unwrap().is_some());
        assert!(store.insert(schedule).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_respects_order_and_active_job_guard() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();

        let mut b = sample("b", ScheduleKind::ConcurrentInterval, Some(now - Duration::seconds(5)));
        b.next_run_at = Some(now - Duration::seconds(5));
        store.insert(b).await.unwrap();

        let a = sample("a", ScheduleKind::SequentialInterval, Some(now - Duration::seconds(10)));
        store.insert(a).await.unwrap();

        let mut blocked = sample("blocked", ScheduleKind::SequentialInterval, Some(now - Duration::seconds(20)));
        blocked.active_job_id = Some(Uuid::new_v4());
        store.insert(blocked).await.unwrap();

        let mut future = sample("future", ScheduleKind::OneOff, Some(now + Duration::seconds(60)));
        future.next_run_at = Some(now + Duration::seconds(60));
        store.insert(future).await.unwrap();

        let due = store.due(now).await.unwrap();
        let names: Vec<&str> = due.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_transient_only_removes_transient_rows() {
        let store = MemoryScheduleStore::new();
        let mut transient = sample("temp", ScheduleKind::ConcurrentInterval, None);
        transient.is_persistent = false;
        store.insert(transient).await.unwrap();
        store
            .insert(sample("kept", ScheduleKind::ConcurrentInterval, None))
            .await
            .unwrap();

        assert_eq!(store.delete_transient().await.unwrap(), 1);
        assert!(store.find_by_name("temp").await.unwrap().is_none());
        assert!(store.find_by_name("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = MemoryScheduleStore::new();
        let mut paused = sample("p", ScheduleKind::OneOff, None);
        paused.status = ScheduleStatus::Paused;
        store.insert(paused).await.unwrap();
        store.insert(sample("a", ScheduleKind::OneOff, None)).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let active = store.list(Some(ScheduleStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "a");
    }

    #[tokio::test]
    async fn update_if_tracking_requires_the_matching_active_job() {
        let store = MemoryScheduleStore::new();
        let tracked = Uuid::new_v4();
        let mut schedule = sample("s", ScheduleKind::SequentialInterval, None);
        schedule.active_job_id = Some(tracked);
        store.insert(schedule.clone()).await.unwrap();

        let mut advanced = schedule.clone();
        advanced.active_job_id = None;

        // A foreign job id loses the condition and writes nothing.
        assert!(store
            .update_if_tracking(&advanced, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.find_by_name("s").await.unwrap().unwrap().active_job_id,
            Some(tracked)
        );

        // The tracked id wins once; a replay no-ops.
        assert!(store
            .update_if_tracking(&advanced, tracked)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .update_if_tracking(&advanced, tracked)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_refreshes_updated_at_and_requires_presence() {
        let store = MemoryScheduleStore::new();
        let schedule = sample("s", ScheduleKind::OneOff, None);
        store.insert(schedule.clone()).await.unwrap();

        let updated = store.update(&schedule).await.unwrap().unwrap();
        assert!(updated.updated_at >= schedule.updated_at);

        let ghost = sample("ghost", ScheduleKind::OneOff, None);
        assert!(store.update(&ghost).await.unwrap().is_none());
    }
}
