//! Credit ledger tests: daily caps, idempotent grants, quota reset.

mod helpers;

use chrono::{Duration, Utc};
use helpers::{admin_ctx, harness, harness_with_config, user_ctx};
use openpenpal_core::config::{CoreConfig, CreditRuleConfig};
use openpenpal_core::credit::{CreditEventKind, GrantOutcome, PendingGrant};
use openpenpal_core::scheduler::{keys, ScheduledTask};
use openpenpal_core::{CoreStore, OpCode};
use uuid::Uuid;

fn op(s: &str) -> OpCode {
    OpCode::parse(s).expect("valid op-code")
}

/// letter_created pays 10/day up to 5; letter_generated switched off so the
/// arithmetic below stays readable.
fn capped_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.credit.rules.insert(
        "letter_created".to_string(),
        CreditRuleConfig {
            points: Some(10),
            daily_limit: Some(5),
            ..Default::default()
        },
    );
    config.credit.rules.insert(
        "letter_generated".to_string(),
        CreditRuleConfig {
            active: Some(false),
            ..Default::default()
        },
    );
    config
}

#[tokio::test]
async fn sixth_letter_of_the_day_earns_nothing() {
    let h = harness_with_config(capped_config());
    let alice = user_ctx("alice");

    for i in 0..6 {
        h.engine
            .create_barcode(&alice, Some(format!("letter-{i}")), Some(op("PK5F01")), None)
            .await
            .expect("create");
    }

    // 5 grants inserted; the 6th was a silent no-op.
    assert_eq!(h.store.credit_balance("alice").await.expect("balance"), 50);
    let (daily, weekly) = h
        .store
        .credit_counters("alice", CreditEventKind::LetterCreated)
        .await
        .expect("counters");
    assert_eq!(daily, 5);
    assert_eq!(weekly, 5);
}

#[tokio::test]
async fn grant_is_idempotent_per_event_id() {
    let h = harness();
    let event_id = Uuid::new_v4();
    let pending = PendingGrant {
        user_ref: "alice".to_string(),
        kind: CreditEventKind::LetterDelivered,
        points: 20,
        daily_limit: None,
        weekly_limit: None,
    };

    let first = h
        .store
        .apply_grant(pending.clone(), event_id)
        .await
        .expect("grant");
    let granted = match first {
        GrantOutcome::Granted(grant) => grant,
        other => panic!("expected fresh grant, got {other:?}"),
    };

    // Same (user, kind, event): the original comes back, nothing is added.
    let second = h
        .store
        .apply_grant(pending, event_id)
        .await
        .expect("replay");
    match second {
        GrantOutcome::Existing(existing) => assert_eq!(existing.id, granted.id),
        other => panic!("expected existing grant, got {other:?}"),
    }
    assert_eq!(h.store.credit_balance("alice").await.expect("balance"), 20);
}

#[tokio::test]
async fn cap_hit_leaves_counters_untouched() {
    let h = harness();
    let pending = PendingGrant {
        user_ref: "bob".to_string(),
        kind: CreditEventKind::PublicLike,
        points: 2,
        daily_limit: Some(1),
        weekly_limit: None,
    };

    h.store
        .apply_grant(pending.clone(), Uuid::new_v4())
        .await
        .expect("first like");
    let outcome = h
        .store
        .apply_grant(pending, Uuid::new_v4())
        .await
        .expect("second like");
    assert!(matches!(outcome, GrantOutcome::CapReached));

    let (daily, _) = h
        .store
        .credit_counters("bob", CreditEventKind::PublicLike)
        .await
        .expect("counters");
    assert_eq!(daily, 1, "counter unchanged by the capped attempt");
    assert_eq!(h.store.credit_balance("bob").await.expect("balance"), 2);
}

#[tokio::test]
async fn quota_reset_job_reopens_the_daily_window() {
    let h = harness_with_config(capped_config());
    let alice = user_ctx("alice");

    for i in 0..5 {
        h.engine
            .create_barcode(&alice, Some(format!("letter-{i}")), Some(op("PK5F01")), None)
            .await
            .expect("create");
    }
    let (daily, _) = h
        .store
        .credit_counters("alice", CreditEventKind::LetterCreated)
        .await
        .expect("counters");
    assert_eq!(daily, 5);

    h.engine
        .register_scheduled_task(
            &admin_ctx(),
            ScheduledTask::delayed(
                "reset-now",
                Utc::now() - Duration::seconds(1),
                keys::CREDIT_QUOTA_RESET,
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

    let (daily, _) = h
        .store
        .credit_counters("alice", CreditEventKind::LetterCreated)
        .await
        .expect("counters");
    assert_eq!(daily, 0, "daily window reopened");

    // New creations earn again.
    h.engine
        .create_barcode(&alice, Some("letter-after-reset".into()), Some(op("PK5F01")), None)
        .await
        .expect("create");
    assert_eq!(h.store.credit_balance("alice").await.expect("balance"), 60);
}
