//! Scheduler tests: single-fire across competing instances, failure
//! disabling, and the built-in lifecycle jobs.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use helpers::{admin_ctx, harness, user_ctx};
use openpenpal_core::config::SchedulerConfig;
use openpenpal_core::lock::{LockManager, MemoryLeaseStore};
use openpenpal_core::scheduler::{keys, JobContext, JobHandler, ScheduledTask, Scheduler};
use openpenpal_core::{
    Barcode, BarcodeStatus, CoreResult, CoreStore, MemoryStore, OpCode, Recipient,
};
use tokio_util::sync::CancellationToken;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn run(&self, _ctx: JobContext) -> CoreResult<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        // Hold the lease long enough for the competing instances to observe
        // it as busy.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _ctx: JobContext) -> CoreResult<()> {
        Err(openpenpal_core::CoreError::TransientUnavailable(
            "simulated outage".to_string(),
        ))
    }
}

fn scheduler_over(
    store: &Arc<MemoryStore>,
    leases: &Arc<MemoryLeaseStore>,
) -> Scheduler {
    let locks = Arc::new(LockManager::new(
        Arc::clone(leases) as Arc<dyn openpenpal_core::lock::LeaseStore>,
        openpenpal_core::config::LockConfig::default(),
    ));
    Scheduler::new(
        Arc::clone(store) as Arc<dyn CoreStore>,
        locks,
        SchedulerConfig::default(),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn three_instances_fire_a_due_job_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let count = Arc::new(AtomicUsize::new(0));

    let mut schedulers = Vec::new();
    for _ in 0..3 {
        let mut scheduler = scheduler_over(&store, &leases);
        scheduler.register_handler(
            "count",
            Arc::new(CountingHandler {
                count: Arc::clone(&count),
            }),
        );
        schedulers.push(scheduler);
    }

    let due = Utc::now() - Duration::seconds(5);
    schedulers[0]
        .register_task(ScheduledTask::delayed("single-fire", due, "count"))
        .await
        .expect("register");

    let now = Utc::now();
    let (a, b, c) = tokio::join!(
        schedulers[0].tick_once(now),
        schedulers[1].tick_once(now),
        schedulers[2].tick_once(now),
    );
    let reports = [a.expect("tick"), b.expect("tick"), c.expect("tick")];

    assert_eq!(count.load(Ordering::SeqCst), 1, "handler ran exactly once");
    let fired: usize = reports.iter().map(|r| r.fired).sum();
    let skipped: usize = reports.iter().map(|r| r.skipped).sum();
    assert_eq!(fired, 1);
    assert_eq!(skipped, 2);

    // One-shot delays disable themselves after firing.
    let schedule = store
        .schedule_by_id("single-fire")
        .await
        .expect("store")
        .expect("schedule");
    assert!(!schedule.enabled);
    assert!(schedule.next_fire.is_none());
    assert!(schedule.last_fired.is_some());

    // A later tick fires nothing.
    let report = schedulers[0]
        .tick_once(Utc::now())
        .await
        .expect("tick");
    assert_eq!(report.fired, 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_failures_disable_the_job() {
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let mut scheduler = scheduler_over(&store, &leases);
    scheduler.register_handler("flaky", Arc::new(FailingHandler));

    // A recurring job that is already due and stays due on failure.
    let task = ScheduledTask {
        id: "flaky-job".to_string(),
        cron_expr: Some("* * * * *".to_string()),
        delay_until: None,
        handler_key: "flaky".to_string(),
        payload: serde_json::Value::Null,
        enabled: true,
        last_fired: None,
        next_fire: Some(Utc::now() - Duration::minutes(1)),
        failure_count: 0,
    };
    scheduler.register_task(task).await.expect("register");

    for round in 1..=5u32 {
        let report = scheduler.tick_once(Utc::now()).await.expect("tick");
        assert_eq!(report.failed, 1, "round {round} should fail");
    }

    let schedule = store
        .schedule_by_id("flaky-job")
        .await
        .expect("store")
        .expect("schedule");
    assert_eq!(schedule.failure_count, 5);
    assert!(!schedule.enabled, "disabled pending admin action");

    // Disabled jobs stop firing.
    let report = scheduler.tick_once(Utc::now()).await.expect("tick");
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn future_letter_release_binds_released_letters() {
    let h = harness();

    // A future letter: recipient chosen at composition, unlock in the past.
    let mut barcode = Barcode::new(
        "PPFUTURE01".to_string(),
        Some("letter-future".into()),
        "alice".to_string(),
    );
    barcode.sender_op_code = Some(OpCode::parse("PK5F01").expect("op"));
    barcode.recipient = Some(Recipient::Code(OpCode::parse("PK5F3D").expect("op")));
    barcode.release_at = Some(Utc::now() - Duration::minutes(5));
    let barcode = h.store.insert_barcode(barcode).await.expect("insert");

    // And one with no recipient: surfaced for user action instead.
    let mut pending = Barcode::new(
        "PPFUTURE02".to_string(),
        Some("letter-undecided".into()),
        "alice".to_string(),
    );
    pending.release_at = Some(Utc::now() - Duration::minutes(5));
    let pending = h.store.insert_barcode(pending).await.expect("insert");

    h.engine
        .register_scheduled_task(
            &admin_ctx(),
            ScheduledTask::delayed(
                "release-now",
                Utc::now() - Duration::seconds(1),
                keys::FUTURE_LETTER_RELEASE,
            ),
        )
        .await
        .expect("register");

    let report = h
        .engine
        .scheduler()
        .tick_once(Utc::now())
        .await
        .expect("tick");
    assert_eq!(report.fired, 1);

    let released = h.store.barcode_by_id(barcode.id).await.expect("store").expect("barcode");
    assert_eq!(released.status, BarcodeStatus::Bound);
    assert!(released.bound_at.is_some());

    let undecided = h.store.barcode_by_id(pending.id).await.expect("store").expect("barcode");
    assert_eq!(undecided.status, BarcodeStatus::Unactivated);
    assert!(h
        .notifier
        .topics()
        .contains(&"letter.release_pending".to_string()));
}

#[tokio::test]
async fn stale_unbound_barcodes_expire() {
    let h = harness();

    let mut barcode = Barcode::new(
        "PPSTALE001".to_string(),
        Some("letter-stale".into()),
        "alice".to_string(),
    );
    barcode.created_at = Utc::now() - Duration::days(60);
    let barcode = h.store.insert_barcode(barcode).await.expect("insert");

    h.engine
        .register_scheduled_task(
            &admin_ctx(),
            ScheduledTask::delayed(
                "cleanup-now",
                Utc::now() - Duration::seconds(1),
                keys::STALE_UNBOUND_CLEANUP,
            )
            .with_payload(serde_json::json!({ "max_age_days": 30 })),
        )
        .await
        .expect("register");

    let report = h
        .engine
        .scheduler()
        .tick_once(Utc::now())
        .await
        .expect("tick");
    assert_eq!(report.fired, 1);

    let expired = h.store.barcode_by_id(barcode.id).await.expect("store").expect("barcode");
    assert_eq!(expired.status, BarcodeStatus::Expired);
    assert!(h.notifier.topics().contains(&"letter.expired".to_string()));
}

#[tokio::test]
async fn register_scheduled_task_is_admin_only() {
    let h = harness();
    let err = h
        .engine
        .register_scheduled_task(
            &user_ctx("mallory"),
            ScheduledTask::delayed("evil", Utc::now(), "count"),
        )
        .await
        .expect_err("denied");
    assert!(matches!(err, openpenpal_core::CoreError::Forbidden(_)));
}
