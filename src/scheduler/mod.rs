//! Distributed scheduler
//!
//! Leader-free: every instance runs the same tick loop and competes per job
//! on a `scheduler:<task_id>` lease. Losers skip the tick silently; the
//! winner re-checks the schedule row inside the lease before firing, so a
//! slow instance arriving after the winner advanced `next_fire` fires
//! nothing. At any instant, at most one handler per task id executes across
//! all instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{JobConfig, SchedulerConfig};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::store::CoreStore;

pub mod handlers;

/// Built-in job/handler keys.
pub mod keys {
    pub const FUTURE_LETTER_RELEASE: &str = "future_letter_release";
    pub const STALE_UNBOUND_CLEANUP: &str = "stale_unbound_cleanup";
    pub const COURIER_TIMEOUT_SWEEP: &str = "courier_timeout_sweep";
    pub const PUBLIC_DRIFT_MATCH: &str = "public_drift_match";
    pub const CREDIT_QUOTA_RESET: &str = "credit_quota_reset";
    pub const SCAN_EVENT_CLEANUP: &str = "scan_event_cleanup";
}

/// A registered recurring or delayed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Standard 5-field cron expression; `None` for one-shot delays.
    pub cron_expr: Option<String>,
    /// One-shot fire instant; the task disables itself after firing.
    pub delay_until: Option<DateTime<Utc>>,
    pub handler_key: String,
    pub payload: serde_json::Value,
    pub enabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

impl ScheduledTask {
    /// A recurring job. Validates the cron expression and seeds `next_fire`.
    pub fn cron(id: impl Into<String>, expr: &str, handler_key: impl Into<String>) -> CoreResult<Self> {
        let mut task = Self {
            id: id.into(),
            cron_expr: Some(expr.to_string()),
            delay_until: None,
            handler_key: handler_key.into(),
            payload: serde_json::Value::Null,
            enabled: true,
            last_fired: None,
            next_fire: None,
            failure_count: 0,
        };
        task.next_fire = task.compute_next_fire(Utc::now())?;
        Ok(task)
    }

    /// A one-shot job fired once `at` has passed.
    pub fn delayed(id: impl Into<String>, at: DateTime<Utc>, handler_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cron_expr: None,
            delay_until: Some(at),
            handler_key: handler_key.into(),
            payload: serde_json::Value::Null,
            enabled: true,
            last_fired: None,
            next_fire: Some(at),
            failure_count: 0,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Next fire instant strictly after `after`; `None` for exhausted
    /// one-shots.
    pub fn compute_next_fire(&self, after: DateTime<Utc>) -> CoreResult<Option<DateTime<Utc>>> {
        match &self.cron_expr {
            Some(expr) => {
                let cron = Cron::new(expr)
                    .parse()
                    .map_err(|e| CoreError::bad_input(format!("invalid cron {expr:?}: {e}")))?;
                match cron.find_next_occurrence(&after, false) {
                    Ok(next) => Ok(Some(next)),
                    Err(_) => Ok(None),
                }
            }
            None => Ok(if self.last_fired.is_none() {
                self.delay_until
            } else {
                None
            }),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire.is_some_and(|at| at <= now)
    }
}

/// Execution context handed to a job handler. Handlers must honour `cancel`
/// within a short grace period on graceful shutdown.
pub struct JobContext {
    pub payload: serde_json::Value,
    pub cancel: CancellationToken,
    pub fired_at: DateTime<Utc>,
}

/// One schedulable unit of work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> CoreResult<()>;
}

/// Per-tick accounting, mostly for tests and metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum JobRun {
    Ran,
    /// Another instance fired this schedule between our read and our lock.
    AlreadyDone,
}

/// The per-instance tick loop.
pub struct Scheduler {
    store: Arc<dyn CoreStore>,
    locks: Arc<LockManager>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoreStore>,
        locks: Arc<LockManager>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            locks,
            handlers: HashMap::new(),
            config,
            shutdown,
        }
    }

    pub fn register_handler(&mut self, key: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Register (or replace) a schedule. The handler key need not be
    /// registered yet on this instance; another instance may own it.
    pub async fn register_task(&self, mut spec: ScheduledTask) -> CoreResult<String> {
        if spec.cron_expr.is_none() && spec.delay_until.is_none() {
            return Err(CoreError::bad_input(
                "scheduled task needs a cron expression or a delay",
            ));
        }
        if spec.next_fire.is_none() {
            spec.next_fire = spec.compute_next_fire(Utc::now())?;
        }
        let id = spec.id.clone();
        self.store.upsert_schedule(spec).await?;
        Ok(id)
    }

    /// Register the `scheduler.jobs.*` entries from configuration.
    pub async fn load_jobs_from_config(&self) -> CoreResult<()> {
        let jobs: Vec<(String, JobConfig)> = self
            .config
            .jobs
            .iter()
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect();
        for (id, job) in jobs {
            let handler_key = job.handler.clone().unwrap_or_else(|| id.clone());
            let mut spec = match (&job.cron, job.delay_seconds) {
                (Some(expr), _) => ScheduledTask::cron(&id, expr, &handler_key)?,
                (None, Some(secs)) => ScheduledTask::delayed(
                    &id,
                    Utc::now() + chrono::Duration::seconds(secs as i64),
                    &handler_key,
                ),
                (None, None) => {
                    return Err(CoreError::bad_input(format!(
                        "job {id:?} needs cron or delay_seconds"
                    )))
                }
            };
            spec.enabled = job.enabled;
            spec.payload = job.payload.clone();
            self.store.upsert_schedule(spec).await?;
        }
        Ok(())
    }

    /// Run the tick loop until shutdown is requested.
    pub async fn run(&self) {
        let tick = std::time::Duration::from_secs(self.config.tick_interval_seconds.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_seconds = tick.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    match self.tick_once(Utc::now()).await {
                        Ok(report) if report.fired + report.failed > 0 => {
                            debug!(?report, "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "scheduler tick failed"),
                    }
                }
            }
        }
    }

    /// Evaluate every due schedule once. Public so tests (and alternative
    /// drivers) can tick deterministically.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> CoreResult<TickReport> {
        let mut report = TickReport::default();
        for task in self.store.schedules().await? {
            if !task.is_due(now) {
                continue;
            }
            let handler = match self.handlers.get(&task.handler_key) {
                Some(h) => Arc::clone(h),
                None => {
                    debug!(task_id = %task.id, handler = %task.handler_key,
                        "no local handler registered; leaving for another instance");
                    continue;
                }
            };

            let lock_key = format!("scheduler:{}", task.id);
            let store = Arc::clone(&self.store);
            let task_id = task.id.clone();
            let ctx = JobContext {
                payload: task.payload.clone(),
                cancel: self.shutdown.child_token(),
                fired_at: now,
            };

            let outcome = self
                .locks
                .run_if_acquired(&lock_key, self.locks.default_ttl(), async move {
                    // Re-check under the lease: the winner of the previous
                    // contention may already have advanced this schedule.
                    match store.schedule_by_id(&task_id).await? {
                        Some(fresh) if fresh.is_due(now) => {
                            handler.run(ctx).await?;
                            Ok(JobRun::Ran)
                        }
                        _ => Ok(JobRun::AlreadyDone),
                    }
                })
                .await;

            match outcome {
                Ok(None) | Ok(Some(JobRun::AlreadyDone)) => report.skipped += 1,
                Ok(Some(JobRun::Ran)) => {
                    report.fired += 1;
                    self.record_success(task, now).await?;
                }
                Err(err) => {
                    report.failed += 1;
                    self.record_failure(task, &err).await?;
                }
            }
        }
        Ok(report)
    }

    async fn record_success(&self, mut task: ScheduledTask, now: DateTime<Utc>) -> CoreResult<()> {
        task.last_fired = Some(now);
        task.failure_count = 0;
        match task.compute_next_fire(now)? {
            Some(next) if task.cron_expr.is_some() => task.next_fire = Some(next),
            _ => {
                // One-shot delays (and exhausted crons) disable themselves.
                task.next_fire = None;
                task.enabled = false;
            }
        }
        self.store.upsert_schedule(task).await
    }

    async fn record_failure(&self, mut task: ScheduledTask, err: &CoreError) -> CoreResult<()> {
        task.failure_count += 1;
        if task.failure_count >= self.config.failure_disable_threshold {
            task.enabled = false;
            error!(
                task_id = %task.id,
                failures = task.failure_count,
                %err,
                "job disabled after repeated failures; admin action required"
            );
        } else {
            warn!(task_id = %task.id, failures = task.failure_count, %err, "job failed; will retry next tick");
        }
        self.store.upsert_schedule(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cron_task_computes_next_fire() {
        let task = ScheduledTask::cron("nightly", "0 3 * * *", "cleanup").expect("valid cron");
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().expect("ts");
        let next = task.compute_next_fire(after).expect("computes").expect("has next");
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 3, 11, 3, 0, 0).single().expect("ts")
        );
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(ScheduledTask::cron("bad", "not a cron", "x").is_err());
    }

    #[test]
    fn delayed_task_is_due_after_instant() {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().expect("ts");
        let task = ScheduledTask::delayed("once", at, "x");
        assert!(!task.is_due(at - chrono::Duration::seconds(1)));
        assert!(task.is_due(at));
        assert!(task.is_due(at + chrono::Duration::minutes(5)));
    }

    #[test]
    fn disabled_task_is_never_due() {
        let at = Utc::now() - chrono::Duration::minutes(1);
        let mut task = ScheduledTask::delayed("once", at, "x");
        task.enabled = false;
        assert!(!task.is_due(Utc::now()));
    }
}
