//! Postgres `CoreStore`
//!
//! Composes the repositories under sqlx transactions. The CAS update and
//! every dependent write of a lifecycle transition share one transaction,
//! so a failed grant or event insert rolls the whole transition back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::barcode::{Barcode, Page, ScanEvent};
use crate::courier::Courier;
use crate::credit::{CreditEventKind, GrantOutcome, PendingGrant};
use crate::database::{
    barcode_repository, courier_repository, credit_repository, scan_event_repository,
    schedule_repository, task_repository,
};
use crate::error::{CoreError, CoreResult};
use crate::opcode::OpCode;
use crate::scheduler::ScheduledTask;
use crate::store::{CommitOutcome, CoreStore, TransitionCommit};
use crate::task::{DeliveryTask, TaskState};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CoreStore for PgStore {
    // -- barcodes ------------------------------------------------------------

    async fn insert_barcode(&self, barcode: Barcode) -> CoreResult<Barcode> {
        barcode_repository::insert(&self.pool, &barcode).await?;
        Ok(barcode)
    }

    async fn insert_barcodes(&self, barcodes: Vec<Barcode>) -> CoreResult<Vec<Barcode>> {
        let mut tx = self.pool.begin().await?;
        barcode_repository::insert_many(&mut tx, &barcodes).await?;
        tx.commit().await?;
        Ok(barcodes)
    }

    async fn barcode_by_id(&self, id: Uuid) -> CoreResult<Option<Barcode>> {
        barcode_repository::by_id(&self.pool, id).await
    }

    async fn barcode_by_code(&self, code: &str) -> CoreResult<Option<Barcode>> {
        barcode_repository::by_code(&self.pool, code).await
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> CoreResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = barcode_repository::cas_transition(
            &mut tx,
            commit.barcode_id,
            commit.expected_status,
            commit.new_status,
            commit.set_recipient.as_ref().map(|r| r.as_str()),
            commit.set_envelope.as_deref(),
            commit.event.scan_type.is_physical_scan(),
            commit.scanned_by_courier,
        )
        .await?;

        let barcode = match updated {
            Some(barcode) => barcode,
            None => {
                let actual = barcode_repository::status_of(&mut tx, commit.barcode_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::not_found("barcode", commit.barcode_id.to_string())
                    })?;
                tx.rollback().await?;
                return Ok(CommitOutcome::StatusMismatch { actual });
            }
        };

        let event = commit.event.clone().into_event(Utc::now());
        scan_event_repository::insert(&mut tx, &event).await?;

        if commit.complete_task || commit.fail_task {
            let state = if commit.complete_task {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            if let Some(courier_id) =
                task_repository::close_active(&mut tx, commit.barcode_id, state)
                    .await?
                    .flatten()
            {
                courier_repository::bump_counters(&mut tx, courier_id, commit.complete_task)
                    .await?;
            }
        }

        let mut grants = Vec::with_capacity(commit.grants.len());
        for pending in &commit.grants {
            grants.push(credit_repository::apply_grant(&mut tx, pending, event.id).await?);
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed {
            barcode,
            event,
            grants,
        })
    }

    async fn barcodes_release_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>> {
        barcode_repository::release_due(&self.pool, now, limit as i64).await
    }

    async fn barcodes_stale_unbound(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>> {
        barcode_repository::stale_unbound(&self.pool, cutoff, limit as i64).await
    }

    async fn drift_letters_bound_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>> {
        barcode_repository::drift_bound_before(&self.pool, cutoff, limit as i64).await
    }

    // -- scan events ---------------------------------------------------------

    async fn event_by_id(&self, id: Uuid) -> CoreResult<Option<ScanEvent>> {
        scan_event_repository::by_id(&self.pool, id).await
    }

    async fn history(&self, barcode_id: Uuid, page: Page) -> CoreResult<Vec<ScanEvent>> {
        scan_event_repository::history(&self.pool, barcode_id, page).await
    }

    async fn timeline(&self, barcode_id: Uuid) -> CoreResult<Vec<ScanEvent>> {
        scan_event_repository::timeline(&self.pool, barcode_id).await
    }

    async fn prune_events(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        scan_event_repository::prune(&self.pool, older_than).await
    }

    // -- couriers ------------------------------------------------------------

    async fn insert_courier(&self, courier: Courier) -> CoreResult<Courier> {
        courier_repository::insert(&self.pool, &courier).await?;
        Ok(courier)
    }

    async fn courier_by_id(&self, id: Uuid) -> CoreResult<Option<Courier>> {
        courier_repository::by_id(&self.pool, id).await
    }

    async fn courier_by_user(&self, user_ref: &str) -> CoreResult<Option<Courier>> {
        courier_repository::by_user(&self.pool, user_ref).await
    }

    async fn update_courier(&self, courier: Courier) -> CoreResult<()> {
        courier_repository::update(&self.pool, &courier).await
    }

    async fn children_of(&self, parent_id: Uuid) -> CoreResult<Vec<Courier>> {
        courier_repository::children_of(&self.pool, parent_id).await
    }

    async fn city_root_for_prefix(&self, school_prefix: &str) -> CoreResult<Option<Courier>> {
        courier_repository::city_root(&self.pool, school_prefix).await
    }

    async fn active_couriers_covering(&self, target: &OpCode) -> CoreResult<Vec<Courier>> {
        courier_repository::covering(&self.pool, target).await
    }

    // -- delivery tasks ------------------------------------------------------

    async fn insert_task(&self, task: DeliveryTask) -> CoreResult<DeliveryTask> {
        task_repository::insert(&self.pool, &task).await?;
        Ok(task)
    }

    async fn task_by_id(&self, id: Uuid) -> CoreResult<Option<DeliveryTask>> {
        task_repository::by_id(&self.pool, id).await
    }

    async fn active_task_for_barcode(
        &self,
        barcode_id: Uuid,
    ) -> CoreResult<Option<DeliveryTask>> {
        task_repository::active_for_barcode(&self.pool, barcode_id).await
    }

    async fn update_task(&self, task: DeliveryTask) -> CoreResult<()> {
        task_repository::update(&self.pool, &task).await
    }

    async fn overdue_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<DeliveryTask>> {
        task_repository::overdue(&self.pool, now, limit as i64).await
    }

    async fn active_task_count(&self, courier_id: Uuid) -> CoreResult<usize> {
        Ok(task_repository::active_count(&self.pool, courier_id).await? as usize)
    }

    // -- credit ledger -------------------------------------------------------

    async fn apply_grant(
        &self,
        pending: PendingGrant,
        source_event_id: Uuid,
    ) -> CoreResult<GrantOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = credit_repository::apply_grant(&mut tx, &pending, source_event_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn credit_balance(&self, user_ref: &str) -> CoreResult<i64> {
        credit_repository::balance(&self.pool, user_ref).await
    }

    async fn credit_counters(
        &self,
        user_ref: &str,
        kind: CreditEventKind,
    ) -> CoreResult<(u32, u32)> {
        credit_repository::counters(&self.pool, user_ref, kind).await
    }

    async fn reset_daily_counters(&self) -> CoreResult<()> {
        credit_repository::reset_daily(&self.pool).await
    }

    async fn reset_weekly_counters(&self) -> CoreResult<()> {
        credit_repository::reset_weekly(&self.pool).await
    }

    // -- scheduled tasks -----------------------------------------------------

    async fn upsert_schedule(&self, task: ScheduledTask) -> CoreResult<()> {
        schedule_repository::upsert(&self.pool, &task).await
    }

    async fn schedule_by_id(&self, id: &str) -> CoreResult<Option<ScheduledTask>> {
        schedule_repository::by_id(&self.pool, id).await
    }

    async fn schedules(&self) -> CoreResult<Vec<ScheduledTask>> {
        schedule_repository::list(&self.pool).await
    }
}
