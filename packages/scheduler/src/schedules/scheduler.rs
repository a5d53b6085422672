//! Scheduler service.
//!
//! Drives persistent schedules: a tick loop scans for due schedules and
//! emits jobs through the queue; sequential and dynamic schedules advance
//! when their job reaches a terminal status. Completion is detected two
//! ways - a `JobCompleted` subscription for promptness, and a periodic poll
//! of the job rows as the source of truth - so a dropped event (or a
//! restart between finish and advancement) never wedges a schedule.
//!
//! ```text
//! tick loop (every tick_interval)
//!     │ due schedules, (next_run_at ASC, name ASC)
//!     └─► enqueue job from template ─► update schedule row
//!              one_off:             completed
//!              concurrent_interval: next_run_at advanced (drift-free)
//!              sequential/dynamic:  active_job_id = job.id
//!
//! completion (event or poll)
//!     └─► clear active_job_id, advance next_run_at / complete / self-pause
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::events::{
    CompletionOutcome, JobCompleted, SchedulePaused, ScheduleTriggered,
    REASON_CONSECUTIVE_FAILURES,
};
use crate::jobs::{ExecutionMode, Job, JobQueue, JobSpec};

use super::schedule::{advance_interval, Schedule, ScheduleKind, ScheduleSpec, ScheduleStatus};
use super::store::ScheduleStore;

/// `reference_type` stamped on every job a schedule emits; completion
/// events are routed back here by `reference_id = name`.
pub const SCHEDULE_REFERENCE: &str = "schedule";

/// Build the JSON value a dynamic-schedule handler returns to pick its next
/// run time. `None` completes the schedule.
pub fn dynamic_next_run(next_run_at: Option<DateTime<Utc>>) -> Option<Value> {
    Some(serde_json::json!({
        "nextRunAt": next_run_at.map(|at| at.to_rfc3339()),
    }))
}

fn parse_next_run(result: Option<&Value>) -> Option<DateTime<Utc>> {
    match result?.get("nextRunAt")? {
        Value::Null => None,
        Value::String(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(error) => {
                warn!(value = %raw, %error, "unparseable nextRunAt in handler result, completing schedule");
                None
            }
        },
        other => {
            warn!(value = %other, "nextRunAt is not a string, completing schedule");
            None
        }
    }
}

/// Persistent scheduler over a [`ScheduleStore`] and a [`JobQueue`].
/// Cheap to clone; clones share one service.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    schedules: Arc<dyn ScheduleStore>,
    queue: Arc<JobQueue>,
    bus: EventBus,
    config: SchedulerConfig,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl Scheduler {
    pub fn new(schedules: Arc<dyn ScheduleStore>, queue: Arc<JobQueue>, bus: EventBus) -> Self {
        Self::with_config(schedules, queue, bus, SchedulerConfig::default())
    }

    pub fn with_config(
        schedules: Arc<dyn ScheduleStore>,
        queue: Arc<JobQueue>,
        bus: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                schedules,
                queue,
                bus,
                config,
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    // ========================================================================
    // Registration and lifecycle API
    // ========================================================================

    pub async fn register_schedule(&self, spec: ScheduleSpec) -> Result<Schedule, ScheduleError> {
        let now = Utc::now();

        if spec.name.trim().is_empty() {
            return Err(ScheduleError::InvalidConfig("name must not be empty".into()));
        }
        if spec.job_type.trim().is_empty() {
            return Err(ScheduleError::InvalidConfig(
                "job_type must not be empty".into(),
            ));
        }

        match spec.kind {
            ScheduleKind::OneOff | ScheduleKind::Dynamic => {
                let at = spec.next_run_at.ok_or_else(|| {
                    ScheduleError::InvalidConfig(format!(
                        "{} schedules require next_run_at",
                        spec.kind
                    ))
                })?;
                if spec.kind == ScheduleKind::OneOff && at <= now {
                    return Err(ScheduleError::InvalidConfig(
                        "one_off next_run_at must be in the future".into(),
                    ));
                }
            }
            ScheduleKind::ConcurrentInterval | ScheduleKind::SequentialInterval => {
                let interval_ms = spec.interval_ms.ok_or_else(|| {
                    ScheduleError::InvalidConfig(format!(
                        "{} schedules require interval_ms",
                        spec.kind
                    ))
                })?;
                if interval_ms <= 0 {
                    return Err(ScheduleError::InvalidConfig(
                        "interval_ms must be positive".into(),
                    ));
                }
            }
        }

        let next_run_at = if spec.kind.is_interval() {
            spec.next_run_at
                .or_else(|| Some(now + chrono::Duration::milliseconds(spec.interval_ms.unwrap_or(0))))
        } else {
            spec.next_run_at
        };

        let schedule = Schedule {
            name: spec.name.clone(),
            description: spec.description,
            kind: spec.kind,
            status: ScheduleStatus::Active,
            next_run_at,
            interval_ms: spec.interval_ms,
            job_type: spec.job_type,
            job_payload: spec.job_payload,
            job_priority: spec.job_priority,
            job_max_retries: spec.job_max_retries,
            is_persistent: spec.persistent,
            consecutive_failures: 0,
            max_consecutive_failures: spec
                .max_consecutive_failures
                .unwrap_or(self.inner.config.max_consecutive_failures),
            active_job_id: None,
            last_completed_at: None,
            last_failed_at: None,
            created_at: now,
            updated_at: now,
        };

        let inserted = self
            .inner
            .schedules
            .insert(schedule)
            .await?
            .ok_or(ScheduleError::Duplicate(spec.name))?;
        info!(schedule = %inserted.name, kind = %inserted.kind, "schedule registered");
        Ok(inserted)
    }

    pub async fn pause_schedule(&self, name: &str) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_schedule(name).await?;
        match schedule.status {
            ScheduleStatus::Active => {
                schedule.status = ScheduleStatus::Paused;
                let updated = self.update_or_not_found(schedule).await?;
                info!(schedule = %name, "schedule paused");
                Ok(updated)
            }
            status => Err(ScheduleError::IllegalTransition {
                name: name.to_string(),
                reason: format!("cannot pause a {status} schedule"),
            }),
        }
    }

    pub async fn resume_schedule(&self, name: &str) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_schedule(name).await?;
        match schedule.status {
            ScheduleStatus::Paused => {
                schedule.status = ScheduleStatus::Active;
                schedule.consecutive_failures = 0;
                let updated = self.update_or_not_found(schedule).await?;
                info!(schedule = %name, "schedule resumed");
                Ok(updated)
            }
            status => Err(ScheduleError::IllegalTransition {
                name: name.to_string(),
                reason: format!("cannot resume a {status} schedule"),
            }),
        }
    }

    /// Stop a schedule for good but keep the row for observability.
    pub async fn cancel_schedule(&self, name: &str) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_schedule(name).await?;
        if schedule.status == ScheduleStatus::Completed {
            return Err(ScheduleError::IllegalTransition {
                name: name.to_string(),
                reason: "schedule is already completed".into(),
            });
        }
        schedule.status = ScheduleStatus::Completed;
        schedule.next_run_at = None;
        let updated = self.update_or_not_found(schedule).await?;
        info!(schedule = %name, "schedule cancelled");
        Ok(updated)
    }

    pub async fn delete_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        if !self.inner.schedules.delete(name).await? {
            return Err(ScheduleError::NotFound(name.to_string()));
        }
        info!(schedule = %name, "schedule deleted");
        Ok(())
    }

    /// Enqueue a job from the schedule's template right now, regardless of
    /// `next_run_at`. Legal for active and paused schedules.
    ///
    /// The job runs in concurrent mode and the schedule's own cadence
    /// (`active_job_id`, `next_run_at`) is untouched, so it may execute
    /// alongside an in-flight sequential job.
    pub async fn trigger_now(&self, name: &str) -> Result<Job, ScheduleError> {
        let schedule = self.get_schedule(name).await?;
        if schedule.status == ScheduleStatus::Completed {
            return Err(ScheduleError::IllegalTransition {
                name: name.to_string(),
                reason: "cannot trigger a completed schedule".into(),
            });
        }

        let job = self
            .inner
            .queue
            .enqueue(template_spec(&schedule, ExecutionMode::Concurrent))
            .await?;
        info!(schedule = %name, job_id = %job.id, "schedule triggered manually");
        self.inner.bus.publish(ScheduleTriggered {
            schedule_name: name.to_string(),
            job_id: job.id,
        });
        Ok(job)
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Schedule, ScheduleError> {
        self.inner
            .schedules
            .find_by_name(name)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))
    }

    pub async fn get_schedules(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self.inner.schedules.list(status).await?)
    }

    async fn update_or_not_found(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        let name = schedule.name.clone();
        self.inner
            .schedules
            .update(&schedule)
            .await?
            .ok_or(ScheduleError::NotFound(name))
    }

    // ========================================================================
    // Service lifecycle
    // ========================================================================

    /// Run the startup sequence and begin the tick and completion loops.
    /// Idempotent.
    pub async fn start(&self) -> Result<(), ScheduleError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Transient schedules exist only for the life of one process.
        let removed = match self.inner.schedules.delete_transient().await {
            Ok(removed) => removed,
            Err(error) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(error.into());
            }
        };
        if removed > 0 {
            info!(count = removed, "transient schedules removed on startup");
        }

        if let Err(error) = self.inner.recover().await {
            error!(%error, "schedule recovery failed; continuing");
        }

        let shutdown = CancellationToken::new();
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if self.inner.config.completion_events {
            let inner = self.inner.clone();
            lifecycle.subscription = Some(self.inner.bus.subscribe::<JobCompleted, _, _>(
                move |event| {
                    let inner = inner.clone();
                    async move {
                        inner.handle_completion_event(event).await;
                        Ok(())
                    }
                },
            ));
        }

        let tick_inner = self.inner.clone();
        let tick_shutdown = shutdown.clone();
        lifecycle.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_inner.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(error) = tick_inner.run_tick().await {
                            error!(%error, "scheduler tick failed");
                        }
                    }
                }
            }
        }));

        let poll_inner = self.inner.clone();
        let poll_shutdown = shutdown.clone();
        lifecycle.tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(poll_inner.config.completion_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = poll_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(error) = poll_inner.check_completions().await {
                            error!(%error, "completion poll failed");
                        }
                    }
                }
            }
        }));

        lifecycle.shutdown = Some(shutdown);
        info!("scheduler started");
        Ok(())
    }

    /// Stop accepting ticks and wait for any in-flight iteration.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (shutdown, tasks, subscription) = {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (
                lifecycle.shutdown.take(),
                std::mem::take(&mut lifecycle.tasks),
                lifecycle.subscription.take(),
            )
        };

        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for task in tasks {
            let _ = task.await;
        }
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Internals
// ============================================================================

fn template_spec(schedule: &Schedule, execution_mode: ExecutionMode) -> JobSpec {
    JobSpec::builder()
        .job_type(schedule.job_type.clone())
        .payload(schedule.job_payload.clone())
        .priority(schedule.job_priority.unwrap_or(0))
        .max_retries(schedule.job_max_retries.unwrap_or(0))
        .execution_mode(execution_mode)
        .reference_type(Some(SCHEDULE_REFERENCE.to_string()))
        .reference_id(Some(schedule.name.clone()))
        .build()
}

impl SchedulerInner {
    /// Startup repair: any completion-driven schedule whose `active_job_id`
    /// points at a terminal or missing job is advanced as if the completion
    /// had just been observed.
    async fn recover(&self) -> Result<()> {
        for schedule in self.schedules.with_active_job().await? {
            let Some(job_id) = schedule.active_job_id else {
                continue;
            };
            match self.queue.get(job_id).await {
                Ok(job) if job.status.is_terminal() => {
                    let name = schedule.name.clone();
                    if let Err(error) = self.apply_job_row_completion(schedule, &job).await {
                        warn!(schedule = %name, %error, "recovery failed for schedule");
                    }
                }
                Ok(_) => {} // still in flight; orphan reclaim owns the job side
                Err(crate::error::QueueError::NotFound(_)) => {
                    let name = schedule.name.clone();
                    if let Err(error) = self.repair_dangling(schedule).await {
                        warn!(schedule = %name, %error, "recovery failed for schedule");
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn run_tick(&self) -> Result<()> {
        let now = Utc::now();
        for schedule in self.schedules.due(now).await? {
            let name = schedule.name.clone();
            if let Err(error) = self.fire(schedule, now).await {
                warn!(schedule = %name, %error, "failed to fire schedule");
            }
        }
        Ok(())
    }

    /// Emit one job for a due schedule and advance the row. At most one
    /// job per schedule per tick: catch-up never bursts.
    async fn fire(&self, mut schedule: Schedule, now: DateTime<Utc>) -> Result<()> {
        let execution_mode = if schedule.kind.is_completion_driven() {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Concurrent
        };
        let job = self
            .queue
            .enqueue(template_spec(&schedule, execution_mode))
            .await?;

        match schedule.kind {
            ScheduleKind::OneOff => {
                schedule.status = ScheduleStatus::Completed;
                schedule.next_run_at = None;
            }
            ScheduleKind::ConcurrentInterval => {
                let fired_at = schedule.next_run_at.unwrap_or(now);
                let interval_ms = schedule.interval_ms.unwrap_or(1);
                schedule.next_run_at =
                    Some(advance_interval(fired_at, interval_ms, now, self.config.catch_up));
            }
            ScheduleKind::SequentialInterval | ScheduleKind::Dynamic => {
                schedule.active_job_id = Some(job.id);
            }
        }

        let Some(schedule) = self.schedules.update(&schedule).await? else {
            // The schedule vanished between the scan and the update; take
            // the emitted job back out of the queue.
            let _ = self.queue.request_cancel(job.id).await;
            bail!("schedule was deleted mid-fire");
        };

        debug!(schedule = %schedule.name, job_id = %job.id, kind = %schedule.kind, "schedule fired");
        self.bus.publish(ScheduleTriggered {
            schedule_name: schedule.name.clone(),
            job_id: job.id,
        });

        // A very fast worker may have finished the job before the row above
        // recorded it as in flight, in which case the completion event was
        // ignored. Catch that here rather than waiting out the poll.
        if schedule.kind.is_completion_driven() {
            if let Ok(row) = self.queue.get(job.id).await {
                if row.status.is_terminal() {
                    self.apply_job_row_completion(schedule, &row).await?;
                }
            }
        }
        Ok(())
    }

    /// Event-path completion. The poll path covers dropped events.
    async fn handle_completion_event(&self, event: JobCompleted) {
        if event.reference_type.as_deref() != Some(SCHEDULE_REFERENCE) {
            return;
        }
        let Some(name) = event.reference_id.as_deref() else {
            return;
        };
        let schedule = match self.schedules.find_by_name(name).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(error) => {
                warn!(schedule = %name, %error, "completion lookup failed; poll will retry");
                return;
            }
        };
        if !schedule.kind.is_completion_driven() {
            return;
        }
        // Only the tracked job advances the schedule; manual trigger_now
        // jobs share the reference but not the slot.
        if schedule.active_job_id != Some(event.job_id) {
            return;
        }
        if let Err(error) = self
            .apply_completion(
                schedule,
                event.job_id,
                event.outcome,
                event.result.as_ref(),
                event.error.clone(),
            )
            .await
        {
            warn!(schedule = %name, %error, "completion handling failed; poll will retry");
        }
    }

    /// Poll-path completion: schedules whose tracked job is terminal (or
    /// gone) are advanced from the job row itself.
    async fn check_completions(&self) -> Result<()> {
        for schedule in self.schedules.with_active_job().await? {
            let Some(job_id) = schedule.active_job_id else {
                continue;
            };
            let name = schedule.name.clone();
            let outcome = match self.queue.get(job_id).await {
                Ok(job) if job.status.is_terminal() => {
                    self.apply_job_row_completion(schedule, &job).await
                }
                Ok(_) => continue,
                Err(crate::error::QueueError::NotFound(_)) => self.repair_dangling(schedule).await,
                Err(error) => return Err(error.into()),
            };
            if let Err(error) = outcome {
                warn!(schedule = %name, %error, "completion poll failed for schedule");
            }
        }
        Ok(())
    }

    async fn apply_job_row_completion(&self, schedule: Schedule, job: &Job) -> Result<()> {
        let outcome = match job.status {
            crate::jobs::JobStatus::Succeeded => CompletionOutcome::Succeeded,
            crate::jobs::JobStatus::Failed => CompletionOutcome::Failed,
            crate::jobs::JobStatus::Cancelled => CompletionOutcome::Cancelled,
            status => bail!("job {} is not terminal ({status})", job.id),
        };
        self.apply_completion(
            schedule,
            job.id,
            outcome,
            job.result.as_ref(),
            job.last_error.clone(),
        )
        .await
    }

    /// Shared completion routine for the event and poll paths. The final
    /// write only lands while the row still tracks `job_id`, so concurrent
    /// observers of the same completion collapse to one application.
    async fn apply_completion(
        &self,
        mut schedule: Schedule,
        job_id: uuid::Uuid,
        outcome: CompletionOutcome,
        result: Option<&Value>,
        error: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        schedule.active_job_id = None;

        if schedule.status != ScheduleStatus::Active {
            // Paused or cancelled while the job was in flight: release the
            // slot, change nothing else.
            self.schedules.update_if_tracking(&schedule, job_id).await?;
            return Ok(());
        }

        let mut pause = false;
        match outcome {
            CompletionOutcome::Succeeded => {
                schedule.last_completed_at = Some(now);
                schedule.consecutive_failures = 0;
                match schedule.kind {
                    ScheduleKind::SequentialInterval => {
                        schedule.next_run_at = schedule.interval().map(|i| now + i);
                    }
                    ScheduleKind::Dynamic => match parse_next_run(result) {
                        Some(at) => schedule.next_run_at = Some(at),
                        None => {
                            schedule.status = ScheduleStatus::Completed;
                            schedule.next_run_at = None;
                            info!(schedule = %schedule.name, "dynamic schedule completed");
                        }
                    },
                    _ => {}
                }
            }
            CompletionOutcome::Failed => {
                schedule.last_failed_at = Some(now);
                schedule.consecutive_failures += 1;
                warn!(
                    schedule = %schedule.name,
                    consecutive_failures = schedule.consecutive_failures,
                    error = error.as_deref().unwrap_or("unknown"),
                    "schedule job failed"
                );
                if schedule.consecutive_failures >= schedule.max_consecutive_failures {
                    schedule.status = ScheduleStatus::Paused;
                    pause = true;
                } else if schedule.kind == ScheduleKind::SequentialInterval {
                    schedule.next_run_at = schedule.interval().map(|i| now + i);
                }
                // Dynamic: next_run_at is already due, so the next tick
                // retries the handler.
            }
            CompletionOutcome::Cancelled => {
                schedule.last_failed_at = Some(now);
                if schedule.kind == ScheduleKind::SequentialInterval {
                    schedule.next_run_at = schedule.interval().map(|i| now + i);
                }
            }
        }

        if self
            .schedules
            .update_if_tracking(&schedule, job_id)
            .await?
            .is_none()
        {
            debug!(schedule = %schedule.name, "completion already applied elsewhere");
            return Ok(());
        }

        if pause {
            warn!(
                schedule = %schedule.name,
                max_consecutive_failures = schedule.max_consecutive_failures,
                "schedule paused after repeated failures"
            );
            self.bus.publish(SchedulePaused {
                schedule_name: schedule.name.clone(),
                reason: REASON_CONSECUTIVE_FAILURES.to_string(),
            });
        }
        Ok(())
    }

    /// `active_job_id` points at a job that no longer exists.
    async fn repair_dangling(&self, mut schedule: Schedule) -> Result<()> {
        warn!(schedule = %schedule.name, "active job row is missing, repairing");
        let Some(dangling) = schedule.active_job_id else {
            return Ok(());
        };
        schedule.active_job_id = None;
        match schedule.kind {
            ScheduleKind::SequentialInterval => {
                let now = Utc::now();
                schedule.next_run_at = schedule
                    .last_completed_at
                    .and_then(|at| schedule.interval().map(|i| at + i))
                    .or(Some(now));
            }
            ScheduleKind::Dynamic => {
                if schedule.next_run_at.is_none() {
                    schedule.status = ScheduleStatus::Completed;
                }
            }
            _ => {}
        }
        self.schedules.update_if_tracking(&schedule, dangling).await?;
        Ok(())
    }
}
