//! Storage abstraction
//!
//! `CoreStore` is the single transactional boundary the lifecycle
//! coordinator composes everything under. Backends must make
//! [`CoreStore::commit_transition`] atomic: the status CAS, the event
//! append, task completion and credit grants all land together or not at
//! all. The in-memory implementation backs unit and integration tests; the
//! Postgres implementation lives in `crate::database` behind the
//! `database` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::barcode::{Barcode, BarcodeStatus, NewScanEvent, Page, ScanEvent};
use crate::courier::Courier;
use crate::credit::{CreditEventKind, GrantOutcome, PendingGrant};
use crate::error::CoreResult;
use crate::opcode::{OpCode, Recipient};
use crate::scheduler::ScheduledTask;
use crate::task::DeliveryTask;

pub mod memory;

pub use memory::MemoryStore;

/// Everything a lifecycle transition mutates, committed as one atomic unit.
///
/// The CAS on `expected_status` is the sole synchronisation point for
/// barcode state; a mismatch aborts the whole commit and the coordinator
/// reloads and retries.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub barcode_id: Uuid,
    pub expected_status: BarcodeStatus,
    pub new_status: BarcodeStatus,
    /// The witnessing scan event; its id doubles as the credit dedup key.
    pub event: NewScanEvent,
    /// Recipient assignment (bind) or drift-letter substitution (delivery).
    pub set_recipient: Option<Recipient>,
    pub set_envelope: Option<String>,
    /// Courier performing a physical scan; drives `last_scanned_by`.
    pub scanned_by_courier: Option<Uuid>,
    /// Mark the barcode's active task completed (successful delivery).
    pub complete_task: bool,
    /// Mark the barcode's active task failed (cancellation).
    pub fail_task: bool,
    /// Credit grants keyed by `event.id`.
    pub grants: Vec<PendingGrant>,
}

impl TransitionCommit {
    pub fn new(
        barcode_id: Uuid,
        expected_status: BarcodeStatus,
        new_status: BarcodeStatus,
        event: NewScanEvent,
    ) -> Self {
        Self {
            barcode_id,
            expected_status,
            new_status,
            event,
            set_recipient: None,
            set_envelope: None,
            scanned_by_courier: None,
            complete_task: false,
            fail_task: false,
            grants: Vec::new(),
        }
    }
}

/// Result of a transition commit attempt.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed {
        barcode: Barcode,
        event: ScanEvent,
        grants: Vec<GrantOutcome>,
    },
    /// The CAS lost: someone else moved the barcode first.
    StatusMismatch { actual: BarcodeStatus },
}

/// Durable-store operations the core depends on. All methods are atomic at
/// the statement level; `commit_transition` is atomic across all its writes.
#[async_trait]
pub trait CoreStore: Send + Sync {
    // -- barcodes ------------------------------------------------------------

    /// Insert a fresh barcode; duplicate codes surface as `CodeCollision`.
    async fn insert_barcode(&self, barcode: Barcode) -> CoreResult<Barcode>;

    /// Insert a batch atomically: every barcode lands or none does. A
    /// duplicate code — within the batch or against existing rows —
    /// surfaces as `CodeCollision` and leaves the store untouched.
    async fn insert_barcodes(&self, barcodes: Vec<Barcode>) -> CoreResult<Vec<Barcode>>;

    async fn barcode_by_id(&self, id: Uuid) -> CoreResult<Option<Barcode>>;

    async fn barcode_by_code(&self, code: &str) -> CoreResult<Option<Barcode>>;

    /// Compare-and-swap lifecycle commit; see [`TransitionCommit`].
    async fn commit_transition(&self, commit: TransitionCommit) -> CoreResult<CommitOutcome>;

    /// Unactivated barcodes whose `release_at` has passed (future letters).
    async fn barcodes_release_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>>;

    /// Unactivated barcodes created before `cutoff` (stale, never bound).
    async fn barcodes_stale_unbound(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>>;

    /// `PUBLIC`-bound drift letters that entered `bound` before `cutoff`.
    async fn drift_letters_bound_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>>;

    // -- scan events ---------------------------------------------------------

    async fn event_by_id(&self, id: Uuid) -> CoreResult<Option<ScanEvent>>;

    /// Newest-first page of a barcode's events.
    async fn history(&self, barcode_id: Uuid, page: Page) -> CoreResult<Vec<ScanEvent>>;

    /// Oldest-first, complete event stream for one barcode.
    async fn timeline(&self, barcode_id: Uuid) -> CoreResult<Vec<ScanEvent>>;

    /// Remove events older than `older_than` whose barcode is terminal.
    /// Returns the number removed.
    async fn prune_events(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    // -- couriers ------------------------------------------------------------

    async fn insert_courier(&self, courier: Courier) -> CoreResult<Courier>;

    async fn courier_by_id(&self, id: Uuid) -> CoreResult<Option<Courier>>;

    async fn courier_by_user(&self, user_ref: &str) -> CoreResult<Option<Courier>>;

    async fn update_courier(&self, courier: Courier) -> CoreResult<()>;

    async fn children_of(&self, parent_id: Uuid) -> CoreResult<Vec<Courier>>;

    /// The unique city (L4) root for a school prefix, if any.
    async fn city_root_for_prefix(&self, school_prefix: &str) -> CoreResult<Option<Courier>>;

    /// Active couriers whose managed prefix covers `target`.
    async fn active_couriers_covering(&self, target: &OpCode) -> CoreResult<Vec<Courier>>;

    // -- delivery tasks ------------------------------------------------------

    /// Insert a task; a second active task for the same barcode is a
    /// `Conflict`.
    async fn insert_task(&self, task: DeliveryTask) -> CoreResult<DeliveryTask>;

    async fn task_by_id(&self, id: Uuid) -> CoreResult<Option<DeliveryTask>>;

    async fn active_task_for_barcode(&self, barcode_id: Uuid)
        -> CoreResult<Option<DeliveryTask>>;

    async fn update_task(&self, task: DeliveryTask) -> CoreResult<()>;

    /// Non-terminal tasks past their deadline, oldest first.
    async fn overdue_tasks(&self, now: DateTime<Utc>, limit: usize)
        -> CoreResult<Vec<DeliveryTask>>;

    async fn active_task_count(&self, courier_id: Uuid) -> CoreResult<usize>;

    // -- credit ledger -------------------------------------------------------

    /// Apply one grant atomically: idempotency by
    /// `(user_ref, kind, source_event_id)`, then caps, then insert + counter
    /// + balance updates.
    async fn apply_grant(
        &self,
        pending: PendingGrant,
        source_event_id: Uuid,
    ) -> CoreResult<GrantOutcome>;

    async fn credit_balance(&self, user_ref: &str) -> CoreResult<i64>;

    /// `(daily, weekly)` counters for one user/kind pair.
    async fn credit_counters(
        &self,
        user_ref: &str,
        kind: CreditEventKind,
    ) -> CoreResult<(u32, u32)>;

    async fn reset_daily_counters(&self) -> CoreResult<()>;

    async fn reset_weekly_counters(&self) -> CoreResult<()>;

    // -- scheduled tasks -----------------------------------------------------

    async fn upsert_schedule(&self, task: ScheduledTask) -> CoreResult<()>;

    async fn schedule_by_id(&self, id: &str) -> CoreResult<Option<ScheduledTask>>;

    async fn schedules(&self) -> CoreResult<Vec<ScheduledTask>>;
}
