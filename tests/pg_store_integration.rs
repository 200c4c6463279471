//! Postgres mirrors of the core store flows
//!
//! Requires: DATABASE_URL environment variable and the `database` feature.

#![cfg(feature = "database")]

use openpenpal_core::barcode::{Barcode, BarcodeStatus, NewScanEvent, ScanType};
use openpenpal_core::credit::{CreditEventKind, GrantOutcome, PendingGrant};
use openpenpal_core::database::{DatabaseConfig, DatabaseManager, PgStore};
use openpenpal_core::opcode::{OpCode, Recipient};
use openpenpal_core::permission::Role;
use openpenpal_core::store::{CommitOutcome, CoreStore, TransitionCommit};
use openpenpal_core::CoreError;
use uuid::Uuid;

async fn test_store() -> PgStore {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let manager = DatabaseManager::new(DatabaseConfig::default())
        .await
        .expect("Failed to connect to test database");
    manager.migrate().await.expect("Failed to run migrations");
    PgStore::new(manager.pool().clone())
}

fn fresh_barcode() -> Barcode {
    Barcode::new(
        format!("PPTEST{}", Uuid::new_v4().simple()),
        Some("letter-test".to_string()),
        "alice".to_string(),
    )
}

fn bind_event(barcode: &Barcode) -> NewScanEvent {
    NewScanEvent {
        id: Uuid::new_v4(),
        barcode_id: barcode.id,
        scan_type: ScanType::Bind,
        actor_id: "alice".to_string(),
        actor_role: Role::User,
        op_code: None,
        latitude: None,
        longitude: None,
        user_agent: None,
        ip: None,
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn insert_and_fetch_round_trip() {
    let store = test_store().await;
    let barcode = fresh_barcode();
    let inserted = store.insert_barcode(barcode.clone()).await.expect("insert");

    let by_id = store
        .barcode_by_id(inserted.id)
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(by_id.code, barcode.code);
    assert_eq!(by_id.status, BarcodeStatus::Unactivated);

    let by_code = store
        .barcode_by_code(&barcode.code)
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(by_code.id, inserted.id);
}

#[tokio::test]
async fn batch_insert_rolls_back_on_collision() {
    let store = test_store().await;
    let existing = store
        .insert_barcode(fresh_barcode())
        .await
        .expect("existing barcode");

    let survivor_a = fresh_barcode();
    let survivor_b = fresh_barcode();
    let mut duplicate = fresh_barcode();
    duplicate.code = existing.code.clone();

    let err = store
        .insert_barcodes(vec![survivor_a.clone(), duplicate, survivor_b.clone()])
        .await
        .expect_err("collision aborts the batch");
    assert!(matches!(err, CoreError::CodeCollision { .. }));

    // The transaction rolled back: no partial writes.
    assert!(store
        .barcode_by_code(&survivor_a.code)
        .await
        .expect("fetch")
        .is_none());
    assert!(store
        .barcode_by_code(&survivor_b.code)
        .await
        .expect("fetch")
        .is_none());
}

#[tokio::test]
async fn duplicate_code_is_a_collision() {
    let store = test_store().await;
    let barcode = fresh_barcode();
    store.insert_barcode(barcode.clone()).await.expect("insert");

    let mut duplicate = fresh_barcode();
    duplicate.code = barcode.code.clone();
    let err = store
        .insert_barcode(duplicate)
        .await
        .expect_err("duplicate rejected");
    assert!(matches!(err, CoreError::CodeCollision { .. }));
}

#[tokio::test]
async fn cas_commit_applies_event_and_timestamps() {
    let store = test_store().await;
    let barcode = store
        .insert_barcode(fresh_barcode())
        .await
        .expect("insert");

    let mut commit = TransitionCommit::new(
        barcode.id,
        BarcodeStatus::Unactivated,
        BarcodeStatus::Bound,
        bind_event(&barcode),
    );
    commit.set_recipient = Some(Recipient::Code(
        OpCode::parse("PK5F3D").expect("valid op-code"),
    ));

    match store.commit_transition(commit).await.expect("commit") {
        CommitOutcome::Committed { barcode, event, .. } => {
            assert_eq!(barcode.status, BarcodeStatus::Bound);
            assert!(barcode.bound_at.is_some());
            assert_eq!(barcode.scan_count, 0, "bind is not a physical scan");
            let stored = store
                .event_by_id(event.id)
                .await
                .expect("fetch event")
                .expect("event present");
            assert_eq!(stored.scan_type, ScanType::Bind);
        }
        CommitOutcome::StatusMismatch { actual } => {
            panic!("unexpected CAS miss, status {actual}")
        }
    }
}

#[tokio::test]
async fn cas_miss_reports_current_status() {
    let store = test_store().await;
    let barcode = store
        .insert_barcode(fresh_barcode())
        .await
        .expect("insert");

    let commit = TransitionCommit::new(
        barcode.id,
        BarcodeStatus::Bound, // wrong: the barcode is unactivated
        BarcodeStatus::InTransit,
        bind_event(&barcode),
    );
    match store.commit_transition(commit).await.expect("commit call") {
        CommitOutcome::StatusMismatch { actual } => {
            assert_eq!(actual, BarcodeStatus::Unactivated)
        }
        CommitOutcome::Committed { .. } => panic!("CAS must miss"),
    }

    // And no event leaked out of the rolled-back transaction.
    let timeline = store.timeline(barcode.id).await.expect("timeline");
    assert!(timeline.is_empty());
}

#[tokio::test]
async fn grants_stay_idempotent_under_postgres() {
    let store = test_store().await;
    let event_id = Uuid::new_v4();
    let user_ref = format!("user-{}", Uuid::new_v4().simple());
    let pending = PendingGrant {
        user_ref: user_ref.clone(),
        kind: CreditEventKind::LetterDelivered,
        points: 20,
        daily_limit: None,
        weekly_limit: None,
    };

    let first = store
        .apply_grant(pending.clone(), event_id)
        .await
        .expect("grant");
    assert!(matches!(first, GrantOutcome::Granted(_)));

    let second = store
        .apply_grant(pending, event_id)
        .await
        .expect("replay");
    assert!(matches!(second, GrantOutcome::Existing(_)));

    assert_eq!(
        store.credit_balance(&user_ref).await.expect("balance"),
        20
    );
}
