//! Built-in scheduler jobs
//!
//! Each handler is a thin orchestration over the coordinator, dispatcher and
//! store. Handlers are batch-bounded and honour cancellation between items,
//! so a graceful shutdown never strands a half-processed batch beyond the
//! current item.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Weekday};
use serde_json::json;
use tracing::{info, warn};

use crate::collaborators::{AiMatcher, Notifier};
use crate::dispatch::TaskDispatcher;
use crate::error::CoreResult;
use crate::lifecycle::LifecycleCoordinator;
use crate::scheduler::{keys, JobContext, JobHandler, ScheduledTask, Scheduler};
use crate::store::CoreStore;

fn batch_limit(ctx: &JobContext) -> usize {
    ctx.payload
        .get("batch_limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(100) as usize
}

/// Wire every built-in handler into a scheduler instance.
pub struct BuiltinJobs {
    pub store: Arc<dyn CoreStore>,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub matcher: Arc<dyn AiMatcher>,
    pub notifier: Arc<dyn Notifier>,
}

impl BuiltinJobs {
    pub fn register(&self, scheduler: &mut Scheduler) {
        scheduler.register_handler(
            keys::FUTURE_LETTER_RELEASE,
            Arc::new(FutureLetterRelease {
                store: Arc::clone(&self.store),
                lifecycle: Arc::clone(&self.lifecycle),
                notifier: Arc::clone(&self.notifier),
            }),
        );
        scheduler.register_handler(
            keys::STALE_UNBOUND_CLEANUP,
            Arc::new(StaleUnboundCleanup {
                store: Arc::clone(&self.store),
                lifecycle: Arc::clone(&self.lifecycle),
            }),
        );
        scheduler.register_handler(
            keys::COURIER_TIMEOUT_SWEEP,
            Arc::new(CourierTimeoutSweep {
                dispatcher: Arc::clone(&self.dispatcher),
            }),
        );
        scheduler.register_handler(
            keys::PUBLIC_DRIFT_MATCH,
            Arc::new(PublicDriftMatch {
                store: Arc::clone(&self.store),
                matcher: Arc::clone(&self.matcher),
                notifier: Arc::clone(&self.notifier),
            }),
        );
        scheduler.register_handler(
            keys::CREDIT_QUOTA_RESET,
            Arc::new(CreditQuotaReset {
                store: Arc::clone(&self.store),
            }),
        );
        scheduler.register_handler(
            keys::SCAN_EVENT_CLEANUP,
            Arc::new(ScanEventCleanup {
                lifecycle: Arc::clone(&self.lifecycle),
            }),
        );
    }

    /// The stock schedules; `scheduler.jobs.*` config entries override them
    /// by registering under the same ids.
    pub fn default_schedules() -> CoreResult<Vec<ScheduledTask>> {
        Ok(vec![
            ScheduledTask::cron(
                keys::FUTURE_LETTER_RELEASE,
                "*/10 * * * *",
                keys::FUTURE_LETTER_RELEASE,
            )?,
            ScheduledTask::cron(
                keys::STALE_UNBOUND_CLEANUP,
                "0 3 * * *",
                keys::STALE_UNBOUND_CLEANUP,
            )?,
            ScheduledTask::cron(
                keys::COURIER_TIMEOUT_SWEEP,
                "0 * * * *",
                keys::COURIER_TIMEOUT_SWEEP,
            )?,
            ScheduledTask::cron(
                keys::PUBLIC_DRIFT_MATCH,
                "30 * * * *",
                keys::PUBLIC_DRIFT_MATCH,
            )?,
            ScheduledTask::cron(
                keys::CREDIT_QUOTA_RESET,
                "0 0 * * *",
                keys::CREDIT_QUOTA_RESET,
            )?,
            ScheduledTask::cron(
                keys::SCAN_EVENT_CLEANUP,
                "0 4 * * *",
                keys::SCAN_EVENT_CLEANUP,
            )?,
        ])
    }
}

/// Unlock future letters whose `release_at` has passed: bind those with a
/// recipient, surface the rest for user action.
struct FutureLetterRelease {
    store: Arc<dyn CoreStore>,
    lifecycle: Arc<LifecycleCoordinator>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl JobHandler for FutureLetterRelease {
    async fn run(&self, ctx: JobContext) -> CoreResult<()> {
        let due = self
            .store
            .barcodes_release_due(ctx.fired_at, batch_limit(&ctx))
            .await?;
        for barcode in due {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            if barcode.recipient.is_some() {
                if let Err(err) = self.lifecycle.release_future(barcode.id).await {
                    warn!(barcode_id = %barcode.id, %err, "future letter release failed");
                }
            } else if let Err(err) = self
                .notifier
                .publish(
                    "letter.release_pending",
                    json!({
                        "barcode_id": barcode.id,
                        "sender_ref": barcode.sender_ref,
                    }),
                )
                .await
            {
                warn!(barcode_id = %barcode.id, %err, "release-pending notification failed");
            }
        }
        Ok(())
    }
}

/// Expire barcodes that were never bound within the configured age.
struct StaleUnboundCleanup {
    store: Arc<dyn CoreStore>,
    lifecycle: Arc<LifecycleCoordinator>,
}

#[async_trait]
impl JobHandler for StaleUnboundCleanup {
    async fn run(&self, ctx: JobContext) -> CoreResult<()> {
        let max_age_days = ctx
            .payload
            .get("max_age_days")
            .and_then(|v| v.as_i64())
            .unwrap_or(30);
        let cutoff = ctx.fired_at - Duration::days(max_age_days);
        let stale = self
            .store
            .barcodes_stale_unbound(cutoff, batch_limit(&ctx))
            .await?;
        let mut expired = 0usize;
        for barcode in stale {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.lifecycle.expire(barcode.id).await {
                Ok(_) => expired += 1,
                Err(err) => warn!(barcode_id = %barcode.id, %err, "stale barcode expiry failed"),
            }
        }
        if expired > 0 {
            info!(expired, "stale unbound barcodes expired");
        }
        Ok(())
    }
}

/// Hourly reassignment sweep over overdue delivery legs.
struct CourierTimeoutSweep {
    dispatcher: Arc<TaskDispatcher>,
}

#[async_trait]
impl JobHandler for CourierTimeoutSweep {
    async fn run(&self, ctx: JobContext) -> CoreResult<()> {
        self.dispatcher.sweep_timeouts(ctx.fired_at).await?;
        Ok(())
    }
}

/// Ask the external matcher for recipients for drift letters that have sat
/// in `bound` past the threshold, and record the proposals for the
/// curation flow.
struct PublicDriftMatch {
    store: Arc<dyn CoreStore>,
    matcher: Arc<dyn AiMatcher>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl JobHandler for PublicDriftMatch {
    async fn run(&self, ctx: JobContext) -> CoreResult<()> {
        let threshold_hours = ctx
            .payload
            .get("threshold_hours")
            .and_then(|v| v.as_i64())
            .unwrap_or(24);
        let cutoff = ctx.fired_at - Duration::hours(threshold_hours);
        let drifting = self
            .store
            .drift_letters_bound_before(cutoff, batch_limit(&ctx))
            .await?;
        for barcode in drifting {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let letter_ref = barcode.letter_ref.clone().unwrap_or_else(|| barcode.code.clone());
            match self.matcher.propose_recipient(&letter_ref).await {
                Ok(Some(proposed)) => {
                    if let Err(err) = self
                        .notifier
                        .publish(
                            "drift.match_proposed",
                            json!({
                                "barcode_id": barcode.id,
                                "proposed_op_code": proposed.as_str(),
                            }),
                        )
                        .await
                    {
                        warn!(barcode_id = %barcode.id, %err, "drift proposal publish failed");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(barcode_id = %barcode.id, %err, "drift matcher call failed"),
            }
        }
        Ok(())
    }
}

/// Zero per-day counters; per-week counters fall on the week boundary.
struct CreditQuotaReset {
    store: Arc<dyn CoreStore>,
}

#[async_trait]
impl JobHandler for CreditQuotaReset {
    async fn run(&self, ctx: JobContext) -> CoreResult<()> {
        self.store.reset_daily_counters().await?;
        if ctx.fired_at.weekday() == Weekday::Mon {
            self.store.reset_weekly_counters().await?;
        }
        info!("credit quota counters reset");
        Ok(())
    }
}

/// Retention cleanup over terminal-barcode scan events.
struct ScanEventCleanup {
    lifecycle: Arc<LifecycleCoordinator>,
}

#[async_trait]
impl JobHandler for ScanEventCleanup {
    async fn run(&self, _ctx: JobContext) -> CoreResult<()> {
        self.lifecycle.cleanup_events().await?;
        Ok(())
    }
}
