//! Configuration knobs for the queue, scheduler, and processor.

use std::time::Duration;

use rand::Rng;

/// Retry backoff policy: exponential from a base, capped, with
/// multiplicative jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: i64,
    /// Upper bound on any single delay, in milliseconds.
    pub cap_ms: i64,
    /// Jitter fraction; 0.2 means each delay is scaled by a random factor
    /// in `[0.8, 1.2]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 300_000, // 5 minutes
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay in milliseconds before retrying a job that has already made
    /// `attempt + 1` attempts.
    pub fn delay_ms(&self, attempt: i32) -> i64 {
        let shift = attempt.clamp(0, 30) as u32;
        let raw = self.base_ms.saturating_mul(1i64 << shift).min(self.cap_ms);
        let factor = 1.0 + self.jitter * rand::rng().random_range(-1.0..=1.0);
        ((raw as f64) * factor).max(0.0) as i64
    }
}

/// Configuration for [`crate::jobs::JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Claim lease for callers with no lease policy of their own. The
    /// processor claims and heartbeats with its own configured lease
    /// instead.
    pub default_lease_ms: i64,
    /// Retry backoff for failed jobs with attempts remaining.
    pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 60_000, // 1 minute
            backoff: BackoffConfig::default(),
        }
    }
}

/// How `concurrent_interval` schedules advance after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpPolicy {
    /// `next_run_at += interval`, skipping to the next future multiple when
    /// more than one interval behind. Keeps a drift-free cadence.
    DriftFree,
    /// `next_run_at = now + interval`. The cadence re-anchors on every fire.
    Reset,
}

/// Configuration for [`crate::schedules::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the due-schedule scan.
    pub tick_interval: Duration,
    /// Cadence of the completion-poll fallback. The poll path is the source
    /// of truth; the event path only makes advancement prompt.
    pub completion_check_interval: Duration,
    /// Whether to subscribe to `JobCompleted` events. Disabled in tests
    /// that exercise the poll path alone.
    pub completion_events: bool,
    /// Default for schedules that do not set their own failure ceiling.
    pub max_consecutive_failures: i32,
    /// Advancement policy for concurrent-interval schedules.
    pub catch_up: CatchUpPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            completion_check_interval: Duration::from_secs(5),
            completion_events: true,
            max_consecutive_failures: 5,
            catch_up: CatchUpPolicy::DriftFree,
        }
    }
}

/// Configuration for [`crate::processor::JobProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long to wait between claim attempts when no job is available.
    pub poll_interval: Duration,
    /// Lease duration for claimed jobs. Heartbeats run at a third of this.
    pub lease_ms: i64,
    /// Maximum number of jobs executing at once.
    pub max_concurrency: usize,
    /// Cadence of the orphan-reclaim sweep (also run once at startup).
    pub orphan_reclaim_interval: Duration,
    /// How long `stop()` waits for in-flight handlers before abandoning
    /// their leases to orphan reclaim.
    pub shutdown_grace: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_ms: 60_000,
            max_concurrency: 4,
            orphan_reclaim_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
