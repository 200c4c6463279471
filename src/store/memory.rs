//! In-memory `CoreStore`
//!
//! Reference implementation of the transactional semantics: one mutex around
//! the whole state makes every method — in particular `commit_transition` —
//! atomic. Used by unit and integration tests and by single-process
//! development setups; production deployments use the Postgres store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::barcode::{Barcode, BarcodeStatus, Page, ScanEvent};
use crate::courier::{Courier, CourierLevel, CourierStatus};
use crate::credit::{CreditEventKind, CreditGrant, GrantOutcome, PendingGrant};
use crate::error::{CoreError, CoreResult};
use crate::opcode::{OpCode, Recipient};
use crate::scheduler::ScheduledTask;
use crate::store::{CommitOutcome, CoreStore, TransitionCommit};
use crate::task::{DeliveryTask, TaskState};

#[derive(Default)]
struct Inner {
    barcodes: HashMap<Uuid, Barcode>,
    code_index: HashMap<String, Uuid>,
    events: Vec<ScanEvent>,
    couriers: HashMap<Uuid, Courier>,
    tasks: HashMap<Uuid, DeliveryTask>,
    grants: HashMap<(String, CreditEventKind, Uuid), CreditGrant>,
    balances: HashMap<String, i64>,
    counters: HashMap<(String, CreditEventKind), (u32, u32)>,
    schedules: HashMap<String, ScheduledTask>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Storage("memory store mutex poisoned".to_string()))
    }
}

/// Apply one pending grant under the already-held store lock. Mirrors the
/// SQL path: idempotency first, then caps, then insert + counters + balance.
fn apply_grant_locked(
    inner: &mut Inner,
    pending: PendingGrant,
    source_event_id: Uuid,
    now: DateTime<Utc>,
) -> GrantOutcome {
    let key = (pending.user_ref.clone(), pending.kind, source_event_id);
    if let Some(existing) = inner.grants.get(&key) {
        return GrantOutcome::Existing(existing.clone());
    }
    let (daily, weekly) = inner
        .counters
        .get(&(pending.user_ref.clone(), pending.kind))
        .copied()
        .unwrap_or((0, 0));
    if pending.daily_limit.is_some_and(|limit| daily >= limit)
        || pending.weekly_limit.is_some_and(|limit| weekly >= limit)
    {
        return GrantOutcome::CapReached;
    }
    let grant = CreditGrant {
        id: Uuid::new_v4(),
        user_ref: pending.user_ref.clone(),
        kind: pending.kind,
        points: pending.points,
        source_event_id,
        created_at: now,
    };
    inner.grants.insert(key, grant.clone());
    *inner.balances.entry(pending.user_ref.clone()).or_insert(0) += pending.points;
    let counters = inner
        .counters
        .entry((pending.user_ref, pending.kind))
        .or_insert((0, 0));
    counters.0 += 1;
    counters.1 += 1;
    GrantOutcome::Granted(grant)
}

#[async_trait]
impl CoreStore for MemoryStore {
    // -- barcodes ------------------------------------------------------------

    async fn insert_barcode(&self, barcode: Barcode) -> CoreResult<Barcode> {
        let mut inner = self.lock()?;
        if inner.code_index.contains_key(&barcode.code) {
            return Err(CoreError::CodeCollision {
                code: barcode.code.clone(),
            });
        }
        inner.code_index.insert(barcode.code.clone(), barcode.id);
        inner.barcodes.insert(barcode.id, barcode.clone());
        Ok(barcode)
    }

    async fn insert_barcodes(&self, barcodes: Vec<Barcode>) -> CoreResult<Vec<Barcode>> {
        let mut inner = self.lock()?;
        // Validate the whole batch before touching anything.
        let mut batch_codes = std::collections::HashSet::new();
        for barcode in &barcodes {
            if inner.code_index.contains_key(&barcode.code)
                || !batch_codes.insert(barcode.code.clone())
            {
                return Err(CoreError::CodeCollision {
                    code: barcode.code.clone(),
                });
            }
        }
        for barcode in &barcodes {
            inner.code_index.insert(barcode.code.clone(), barcode.id);
            inner.barcodes.insert(barcode.id, barcode.clone());
        }
        Ok(barcodes)
    }

    async fn barcode_by_id(&self, id: Uuid) -> CoreResult<Option<Barcode>> {
        Ok(self.lock()?.barcodes.get(&id).cloned())
    }

    async fn barcode_by_code(&self, code: &str) -> CoreResult<Option<Barcode>> {
        let inner = self.lock()?;
        Ok(inner
            .code_index
            .get(code)
            .and_then(|id| inner.barcodes.get(id))
            .cloned())
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> CoreResult<CommitOutcome> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        let actual = match inner.barcodes.get(&commit.barcode_id) {
            Some(b) => b.status,
            None => {
                return Err(CoreError::not_found(
                    "barcode",
                    commit.barcode_id.to_string(),
                ))
            }
        };
        if actual != commit.expected_status {
            return Ok(CommitOutcome::StatusMismatch { actual });
        }

        let event = commit.event.clone().into_event(now);

        // Barcode row mutation.
        {
            let barcode = inner
                .barcodes
                .get_mut(&commit.barcode_id)
                .ok_or_else(|| CoreError::not_found("barcode", commit.barcode_id.to_string()))?;
            barcode.status = commit.new_status;
            if let Some(recipient) = &commit.set_recipient {
                barcode.recipient = Some(recipient.clone());
            }
            if let Some(envelope) = &commit.set_envelope {
                barcode.envelope_ref = Some(envelope.clone());
            }
            if commit.new_status == BarcodeStatus::Bound && barcode.bound_at.is_none() {
                barcode.bound_at = Some(now);
            }
            if commit.new_status == BarcodeStatus::Delivered {
                barcode.delivered_at = Some(now);
            }
            if event.scan_type.is_physical_scan() {
                barcode.scan_count += 1;
                barcode.last_scanned_at = Some(now);
                barcode.last_scanned_by = commit.scanned_by_courier;
            }
        }

        inner.events.push(event.clone());

        // Task closure + courier performance counters.
        if commit.complete_task || commit.fail_task {
            let task = inner
                .tasks
                .values()
                .find(|t| t.barcode_id == commit.barcode_id && !t.state.is_terminal())
                .map(|t| t.id);
            if let Some(task_id) = task {
                let courier_id = {
                    let task = inner.tasks.get_mut(&task_id).ok_or_else(|| {
                        CoreError::not_found("task", task_id.to_string())
                    })?;
                    task.state = if commit.complete_task {
                        TaskState::Completed
                    } else {
                        TaskState::Failed
                    };
                    task.completed_at = Some(now);
                    task.assigned_courier_id
                };
                if let Some(courier_id) = courier_id {
                    if let Some(courier) = inner.couriers.get_mut(&courier_id) {
                        courier.completed += 1;
                        if commit.complete_task {
                            courier.successful += 1;
                        }
                    }
                }
            }
        }

        let grants = commit
            .grants
            .into_iter()
            .map(|pending| apply_grant_locked(&mut inner, pending, event.id, now))
            .collect();

        let barcode = inner
            .barcodes
            .get(&commit.barcode_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("barcode", commit.barcode_id.to_string()))?;

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
        let inner = self.lock()?;
        let mut due: Vec<Barcode> = inner
            .barcodes
            .values()
            .filter(|b| b.status == BarcodeStatus::Unactivated)
            .filter(|b| b.release_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.release_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn barcodes_stale_unbound(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>> {
        let inner = self.lock()?;
        let mut stale: Vec<Barcode> = inner
            .barcodes
            .values()
            .filter(|b| b.status == BarcodeStatus::Unactivated && b.release_at.is_none())
            .filter(|b| b.created_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn drift_letters_bound_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<Barcode>> {
        let inner = self.lock()?;
        let mut drifting: Vec<Barcode> = inner
            .barcodes
            .values()
            .filter(|b| b.status == BarcodeStatus::Bound)
            .filter(|b| matches!(b.recipient, Some(Recipient::Public)))
            .filter(|b| b.bound_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        drifting.sort_by_key(|b| b.bound_at);
        drifting.truncate(limit);
        Ok(drifting)
    }

    // -- scan events ---------------------------------------------------------

    async fn event_by_id(&self, id: Uuid) -> CoreResult<Option<ScanEvent>> {
        Ok(self.lock()?.events.iter().find(|e| e.id == id).cloned())
    }

    async fn history(&self, barcode_id: Uuid, page: Page) -> CoreResult<Vec<ScanEvent>> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|e| e.barcode_id == barcode_id)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn timeline(&self, barcode_id: Uuid) -> CoreResult<Vec<ScanEvent>> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.barcode_id == barcode_id)
            .cloned()
            .collect())
    }

    async fn prune_events(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        let mut inner = self.lock()?;
        let terminal: std::collections::HashSet<Uuid> = inner
            .barcodes
            .values()
            .filter(|b| b.status.is_terminal())
            .map(|b| b.id)
            .collect();
        let before = inner.events.len();
        inner
            .events
            .retain(|e| e.created_at >= older_than || !terminal.contains(&e.barcode_id));
        Ok((before - inner.events.len()) as u64)
    }

    // -- couriers ------------------------------------------------------------

    async fn insert_courier(&self, courier: Courier) -> CoreResult<Courier> {
        let mut inner = self.lock()?;
        inner.couriers.insert(courier.id, courier.clone());
        Ok(courier)
    }

    async fn courier_by_id(&self, id: Uuid) -> CoreResult<Option<Courier>> {
        Ok(self.lock()?.couriers.get(&id).cloned())
    }

    async fn courier_by_user(&self, user_ref: &str) -> CoreResult<Option<Courier>> {
        let inner = self.lock()?;
        Ok(inner
            .couriers
            .values()
            .find(|c| c.user_ref == user_ref && c.status != CourierStatus::Resigned)
            .cloned())
    }

    async fn update_courier(&self, courier: Courier) -> CoreResult<()> {
        let mut inner = self.lock()?;
        if !inner.couriers.contains_key(&courier.id) {
            return Err(CoreError::not_found("courier", courier.id.to_string()));
        }
        inner.couriers.insert(courier.id, courier);
        Ok(())
    }

    async fn children_of(&self, parent_id: Uuid) -> CoreResult<Vec<Courier>> {
        let inner = self.lock()?;
        let mut children: Vec<Courier> = inner
            .couriers
            .values()
            .filter(|c| c.parent_id == Some(parent_id) && c.status != CourierStatus::Resigned)
            .cloned()
            .collect();
        children.sort_by_key(|c| c.created_at);
        Ok(children)
    }

    async fn city_root_for_prefix(&self, school_prefix: &str) -> CoreResult<Option<Courier>> {
        let inner = self.lock()?;
        Ok(inner
            .couriers
            .values()
            .find(|c| {
                c.level == CourierLevel::City
                    && c.status != CourierStatus::Resigned
                    && c.managed_prefix.as_str() == school_prefix
            })
            .cloned())
    }

    async fn active_couriers_covering(&self, target: &OpCode) -> CoreResult<Vec<Courier>> {
        let inner = self.lock()?;
        let mut covering: Vec<Courier> = inner
            .couriers
            .values()
            .filter(|c| c.status == CourierStatus::Active && c.managed_prefix.covers(target))
            .cloned()
            .collect();
        covering.sort_by_key(|c| c.created_at);
        Ok(covering)
    }

    // -- delivery tasks ------------------------------------------------------

    async fn insert_task(&self, task: DeliveryTask) -> CoreResult<DeliveryTask> {
        let mut inner = self.lock()?;
        if inner
            .tasks
            .values()
            .any(|t| t.barcode_id == task.barcode_id && !t.state.is_terminal())
        {
            return Err(CoreError::Conflict(format!(
                "barcode {} already has an active task",
                task.barcode_id
            )));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task_by_id(&self, id: Uuid) -> CoreResult<Option<DeliveryTask>> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn active_task_for_barcode(
        &self,
        barcode_id: Uuid,
    ) -> CoreResult<Option<DeliveryTask>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.barcode_id == barcode_id && !t.state.is_terminal())
            .cloned())
    }

    async fn update_task(&self, task: DeliveryTask) -> CoreResult<()> {
        let mut inner = self.lock()?;
        if !inner.tasks.contains_key(&task.id) {
            return Err(CoreError::not_found("task", task.id.to_string()));
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn overdue_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<DeliveryTask>> {
        let inner = self.lock()?;
        let mut overdue: Vec<DeliveryTask> = inner
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Accepted))
            .filter(|t| t.deadline < now)
            .cloned()
            .collect();
        overdue.sort_by_key(|t| t.created_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn active_task_count(&self, courier_id: Uuid) -> CoreResult<usize> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.assigned_courier_id == Some(courier_id) && !t.state.is_terminal())
            .count())
    }

    // -- credit ledger -------------------------------------------------------

    async fn apply_grant(
        &self,
        pending: PendingGrant,
        source_event_id: Uuid,
    ) -> CoreResult<GrantOutcome> {
        let mut inner = self.lock()?;
        Ok(apply_grant_locked(
            &mut inner,
            pending,
            source_event_id,
            Utc::now(),
        ))
    }

    async fn credit_balance(&self, user_ref: &str) -> CoreResult<i64> {
        Ok(self.lock()?.balances.get(user_ref).copied().unwrap_or(0))
    }

    async fn credit_counters(
        &self,
        user_ref: &str,
        kind: CreditEventKind,
    ) -> CoreResult<(u32, u32)> {
        Ok(self
            .lock()?
            .counters
            .get(&(user_ref.to_string(), kind))
            .copied()
            .unwrap_or((0, 0)))
    }

    async fn reset_daily_counters(&self) -> CoreResult<()> {
        for counters in self.lock()?.counters.values_mut() {
            counters.0 = 0;
        }
        Ok(())
    }

    async fn reset_weekly_counters(&self) -> CoreResult<()> {
        for counters in self.lock()?.counters.values_mut() {
            counters.1 = 0;
        }
        Ok(())
    }

    // -- scheduled tasks -----------------------------------------------------

    async fn upsert_schedule(&self, task: ScheduledTask) -> CoreResult<()> {
        self.lock()?.schedules.insert(task.id.clone(), task);
        Ok(())
    }

    async fn schedule_by_id(&self, id: &str) -> CoreResult<Option<ScheduledTask>> {
        Ok(self.lock()?.schedules.get(id).cloned())
    }

    async fn schedules(&self) -> CoreResult<Vec<ScheduledTask>> {
        let mut all: Vec<ScheduledTask> = self.lock()?.schedules.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}
