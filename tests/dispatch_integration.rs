//! Task dispatch: assignment ranking, timeout reassignment, escalation.

mod helpers;

use chrono::{Duration, Utc};
use helpers::{admin_ctx, harness, seed_campus};
use openpenpal_core::lifecycle::BarcodeRef;
use openpenpal_core::{CoreError, CoreStore, OpCode, Recipient, TaskState};

fn op(s: &str) -> OpCode {
    OpCode::parse(s).expect("valid op-code")
}

async fn bound_barcode(h: &helpers::TestHarness, letter: &str) -> openpenpal_core::Barcode {
    let alice = helpers::user_ctx("alice");
    let barcode = h
        .engine
        .create_barcode(&alice, Some(letter.into()), Some(op("PK5F01")), None)
        .await
        .expect("create");
    h.engine
        .bind_barcode(
            &alice,
            BarcodeRef::Id(barcode.id),
            Recipient::Code(op("PK5F3D")),
            None,
        )
        .await
        .expect("bind")
}

#[tokio::test]
async fn assignment_prefers_longest_prefix_then_success_rate() {
    let h = harness();
    let couriers = seed_campus(&h.engine, &[("PK5F3D", "steady"), ("PK5F3D", "shaky")]).await;

    // Same prefix and load; the success rate breaks the tie.
    let mut steady = couriers[0].clone();
    steady.completed = 10;
    steady.successful = 10;
    h.store.update_courier(steady.clone()).await.expect("update");
    let mut shaky = couriers[1].clone();
    shaky.completed = 10;
    shaky.successful = 4;
    h.store.update_courier(shaky).await.expect("update");

    let barcode = bound_barcode(&h, "letter-rank").await;
    let task = h
        .engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(barcode.id),
            op("PK5F01"),
            op("PK5F3D"),
            None,
        )
        .await
        .expect("assign");
    // The building courier outranks area/school couriers (longest prefix),
    // and the reliable one wins the tie.
    assert_eq!(task.assigned_courier_id, Some(steady.id));
}

#[tokio::test]
async fn assignment_prefers_lower_load() {
    let h = harness();
    let couriers = seed_campus(&h.engine, &[("PK5F3D", "busy"), ("PK5F3D", "idle")]).await;

    // Give the first courier an open leg on another barcode.
    let other = bound_barcode(&h, "letter-other").await;
    let busy_task = h
        .engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(other.id),
            op("PK5F01"),
            op("PK5F3D"),
            None,
        )
        .await
        .expect("first assignment");
    let busy_id = busy_task.assigned_courier_id.expect("assigned");

    let barcode = bound_barcode(&h, "letter-load").await;
    let task = h
        .engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(barcode.id),
            op("PK5F01"),
            op("PK5F3D"),
            None,
        )
        .await
        .expect("second assignment");
    let idle_id = couriers
        .iter()
        .map(|c| c.id)
        .find(|id| *id != busy_id)
        .expect("two couriers");
    assert_eq!(task.assigned_courier_id, Some(idle_id));
}

#[tokio::test]
async fn second_active_task_per_barcode_is_rejected() {
    let h = harness();
    seed_campus(&h.engine, &[("PK5F3D", "bob")]).await;
    let barcode = bound_barcode(&h, "letter-dup").await;

    h.engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(barcode.id),
            op("PK5F01"),
            op("PK5F3D"),
            None,
        )
        .await
        .expect("first task");
    let err = h
        .engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(barcode.id),
            op("PK5F01"),
            op("PK5F3D"),
            None,
        )
        .await
        .expect_err("second active task rejected");
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn overdue_task_is_reassigned_away_from_prior_courier() {
    let h = harness();
    let couriers = seed_campus(&h.engine, &[("PK5F3D", "first"), ("PK5F3D", "second")]).await;
    let barcode = bound_barcode(&h, "letter-timeout").await;

    let task = h
        .engine
        .assign_task(
            &admin_ctx(),
            BarcodeRef::Id(barcode.id),
            op("PK5F01"),
            op("PK5F3D"),
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .expect("assign with past deadline");
    let original_assignee = task.assigned_courier_id.expect("assigned");

    let report = h
        .engine
        .dispatcher()
        .sweep_timeouts(Utc::now())
        .await
        .expect("sweep");
    assert_eq!(report.reassigned, 1);

    // Old leg closed, successor handed to the other courier.
    let old = h
        .store
        .task_by_id(task.id)
        .await
        .expect("store")
        .expect("old leg");
    assert_eq!(old.state, TaskState::Reassigned);

    let successor = h
        .store
        .active_task_for_barcode(barcode.id)
        .await
        .expect("store")
        .expect("successor leg");
    assert_eq!(successor.reassign_count, 1);
    let other = couriers
        .iter()
        .map(|c| c.id)
        .find(|id| *id != original_assignee)
        .expect("two couriers");
    assert_eq!(successor.assigned_courier_id, Some(other));
    let prior = successor.metadata["prior_assignees"]
        .as_array()
        .expect("prior assignees recorded");
    assert_eq!(prior.len(), 1);
}

#[tokio::test]
async fn exhausted_reassignments_escalate_to_parent_tier() {
    let h = harness();
    let couriers = seed_campus(&h.engine, &[("PK5F3D", "bob")]).await;
    let barcode = bound_barcode(&h, "letter-escalate").await;

    // A leg that already burned through its reassignments.
    let mut task = openpenpal_core::DeliveryTask::new(
        barcode.id,
        op("PK5F01"),
        op("PK5F3D"),
        Utc::now() - Duration::minutes(1),
    );
    task.assigned_courier_id = Some(couriers[0].id);
    task.reassign_count = 2;
    h.store.insert_task(task.clone()).await.expect("insert");

    let report = h
        .engine
        .dispatcher()
        .sweep_timeouts(Utc::now())
        .await
        .expect("sweep");
    assert_eq!(report.escalated, 1);

    let successor = h
        .store
        .active_task_for_barcode(barcode.id)
        .await
        .expect("store")
        .expect("escalated leg");
    // Escalation lands on the building courier's parent (the area head).
    assert_eq!(
        successor.assigned_courier_id,
        couriers[0].parent_id,
        "escalated to the parent tier"
    );
    assert_eq!(successor.metadata["escalated"], serde_json::json!(true));
    assert!(h
        .notifier
        .topics()
        .contains(&"courier.task_escalated".to_string()));
}
