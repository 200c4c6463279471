//! Lifecycle coordinator
//!
//! Every operation follows the same protocol: permit (oracle), load,
//! preflight (transition table), transact (CAS + event append + task
//! closure + credit grants, atomic in the store), then post-commit
//! notification fan-out. The CAS on `status` is the only synchronisation
//! point, so concurrent scans on different barcodes never contend; a CAS
//! miss reloads and retries with jittered backoff up to three times before
//! surfacing `ConcurrentUpdate`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::barcode::{
    generate_code, Barcode, BarcodeStatus, NewScanEvent, Page, ScanEvent, ScanType,
};
use crate::collaborators::{Notifier, UserDirectory};
use crate::config::CoreConfig;
use crate::credit::{CreditEngine, CreditEventKind, GrantOutcome, PendingGrant};
use crate::error::{CoreError, CoreResult};
use crate::opcode::{OpCode, Recipient};
use crate::permission::{check, Actor, CoreOperation, Decision, PermissionContext, Role};
use crate::store::{CommitOutcome, CoreStore, TransitionCommit};

/// CAS retry budget per operation.
const CAS_RETRIES: u32 = 3;

/// Lookup key accepted by operations reachable from the transport layer.
#[derive(Debug, Clone)]
pub enum BarcodeRef {
    Id(Uuid),
    Code(String),
}

impl From<Uuid> for BarcodeRef {
    fn from(id: Uuid) -> Self {
        BarcodeRef::Id(id)
    }
}

impl std::fmt::Display for BarcodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarcodeRef::Id(id) => write!(f, "{id}"),
            BarcodeRef::Code(code) => f.write_str(code),
        }
    }
}

/// Per-request context: the acting principal plus a cancellation handle
/// honoured at every suspension point.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub actor: Actor,
    pub cancel: CancellationToken,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

impl OpContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            cancel: CancellationToken::new(),
            user_agent: None,
            ip: None,
        }
    }
}

/// A physical scan submitted by a courier.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub barcode: BarcodeRef,
    pub scan_type: ScanType,
    /// Where the scan physically happened; recorded on the event.
    pub op_code: OpCode,
    pub location: Option<(f64, f64)>,
    pub metadata: serde_json::Value,
    /// Client-supplied dedup key: re-issuing the same id is a no-op.
    pub event_id: Option<Uuid>,
}

impl ScanRequest {
    pub fn new(barcode: impl Into<BarcodeRef>, scan_type: ScanType, op_code: OpCode) -> Self {
        Self {
            barcode: barcode.into(),
            scan_type,
            op_code,
            location: None,
            metadata: json!({}),
            event_id: None,
        }
    }
}

/// Outcome of a successful transition.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub barcode: Barcode,
    pub event: ScanEvent,
    pub grants: Vec<GrantOutcome>,
}

pub struct LifecycleCoordinator {
    store: Arc<dyn CoreStore>,
    credit: CreditEngine,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn UserDirectory>,
    config: CoreConfig,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn CoreStore>,
        credit: CreditEngine,
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn UserDirectory>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            credit,
            notifier,
            directory,
            config,
        }
    }

    // -- creation ------------------------------------------------------------

    /// Create one barcode in `unactivated`, generating a unique code.
    pub async fn create(
        &self,
        ctx: &OpContext,
        letter_ref: Option<String>,
        sender_op_code: Option<OpCode>,
        release_at: Option<chrono::DateTime<Utc>>,
    ) -> CoreResult<Barcode> {
        self.permit(&ctx.actor, CoreOperation::CreateBarcode, &PermissionContext::default())?;

        let barcode = self
            .insert_with_fresh_code(|code| {
                let mut barcode = Barcode::new(code, letter_ref.clone(), ctx.actor.user_ref.clone());
                barcode.sender_op_code = sender_op_code.clone();
                barcode.release_at = release_at;
                barcode
            })
            .await?;

        // Creation rewards are keyed by the barcode id: there is no scan
        // event yet, and the id is unique per creation.
        self.settle_grants(
            vec![
                self.credit.pending(&ctx.actor.user_ref, CreditEventKind::LetterCreated),
                self.credit.pending(&ctx.actor.user_ref, CreditEventKind::LetterGenerated),
            ]
            .into_iter()
            .flatten()
            .collect(),
            barcode.id,
        )
        .await;

        self.notify(
            "letter.created",
            json!({ "barcode_id": barcode.id, "code": barcode.code }),
        )
        .await;
        Ok(barcode)
    }

    /// Batch sticker generation for print runs; courier level 3+ or admin.
    /// The whole batch commits in one store transaction: a collision on any
    /// code aborts all of it, and the batch is regenerated and retried.
    pub async fn bulk_create(&self, ctx: &OpContext, count: usize) -> CoreResult<Vec<Barcode>> {
        self.permit(&ctx.actor, CoreOperation::BatchGenerate, &PermissionContext::default())?;
        if count == 0 || count > self.config.barcode.bulk_max {
            return Err(CoreError::bad_input(format!(
                "batch size must be 1..={}, got {count}",
                self.config.barcode.bulk_max
            )));
        }

        let attempts = self.config.barcode.code_retries.max(1);
        for _ in 0..attempts {
            let mut codes = std::collections::HashSet::with_capacity(count);
            let mut batch = Vec::with_capacity(count);
            while batch.len() < count {
                let code = generate_code(&self.config.barcode.code_prefix);
                if !codes.insert(code.clone()) {
                    continue;
                }
                batch.push(Barcode::new(code, None, ctx.actor.user_ref.clone()));
            }
            match self.store.insert_barcodes(batch).await {
                Ok(batch) => {
                    info!(count = batch.len(), actor = %ctx.actor.user_ref, "barcode batch generated");
                    return Ok(batch);
                }
                Err(CoreError::CodeCollision { code }) => {
                    warn!(%code, "batch code collision, regenerating batch");
                }
                Err(other) => return Err(other),
            }
        }
        Err(CoreError::GenerationExhausted { attempts })
    }

    async fn insert_with_fresh_code<F>(&self, build: F) -> CoreResult<Barcode>
    where
        F: Fn(String) -> Barcode,
    {
        let attempts = self.config.barcode.code_retries.max(1);
        for _ in 0..attempts {
            let code = generate_code(&self.config.barcode.code_prefix);
            match self.store.insert_barcode(build(code)).await {
                Ok(barcode) => return Ok(barcode),
                Err(CoreError::CodeCollision { code }) => {
                    warn!(%code, "barcode code collision, regenerating");
                }
                Err(other) => return Err(other),
            }
        }
        Err(CoreError::GenerationExhausted { attempts })
    }

    // -- bind ----------------------------------------------------------------

    /// Attach recipient (and optionally an envelope) to an unactivated
    /// barcode, moving it to `bound`.
    pub async fn bind(
        &self,
        ctx: &OpContext,
        barcode: BarcodeRef,
        recipient: Recipient,
        envelope_ref: Option<String>,
    ) -> CoreResult<Barcode> {
        let barcode_id = self.resolve(&barcode).await?;
        let result = self
            .transact(ctx, barcode_id, |barcode| {
                let perm_ctx = PermissionContext {
                    sender_ref: Some(barcode.sender_ref.clone()),
                    sender_op_code: barcode.sender_op_code.clone(),
                    barcode_status: Some(barcode.status),
                    ..Default::default()
                };
                self.permit(&ctx.actor, CoreOperation::Bind, &perm_ctx)?;
                self.preflight(barcode, BarcodeStatus::Bound)?;

                let event = NewScanEvent {
                    id: Uuid::new_v4(),
                    barcode_id: barcode.id,
                    scan_type: ScanType::Bind,
                    actor_id: ctx.actor.user_ref.clone(),
                    actor_role: ctx.actor.role,
                    op_code: barcode.sender_op_code.clone(),
                    latitude: None,
                    longitude: None,
                    user_agent: ctx.user_agent.clone(),
                    ip: ctx.ip.clone(),
                    metadata: json!({}),
                };
                let mut commit = TransitionCommit::new(
                    barcode.id,
                    barcode.status,
                    BarcodeStatus::Bound,
                    event,
                );
                commit.set_recipient = Some(recipient.clone());
                commit.set_envelope = envelope_ref.clone();
                Ok(commit)
            })
            .await?;

        self.notify(
            "letter.bound",
            json!({
                "barcode_id": result.barcode.id,
                "recipient": result.barcode.recipient.as_ref().map(|r| r.as_str()),
            }),
        )
        .await;
        Ok(result.barcode)
    }

    // -- scan ----------------------------------------------------------------

    /// Apply a courier scan: pickup, transfer or delivery.
    pub async fn scan(&self, ctx: &OpContext, req: ScanRequest) -> CoreResult<TransitionResult> {
        if !req.scan_type.is_physical_scan() {
            return Err(CoreError::bad_input(format!(
                "scan type {} is not a courier scan",
                req.scan_type
            )));
        }
        let barcode_id = self.resolve(&req.barcode).await?;

        // Dedup: a replayed event id returns the committed outcome untouched.
        if let Some(event_id) = req.event_id {
            if let Some(existing) = self.store.event_by_id(event_id).await? {
                if existing.barcode_id != barcode_id {
                    return Err(CoreError::bad_input(format!(
                        "event id {event_id} already belongs to another barcode"
                    )));
                }
                let barcode = self
                    .store
                    .barcode_by_id(barcode_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("barcode", barcode_id.to_string()))?;
                return Ok(TransitionResult {
                    barcode,
                    event: existing,
                    grants: Vec::new(),
                });
            }
        }

        // First-delivery detection reads the courier's counters up front;
        // the grant itself stays idempotent on the event id.
        let first_delivery = match (&ctx.actor.courier, req.scan_type) {
            (Some(identity), ScanType::Delivery) => self
                .store
                .courier_by_id(identity.id)
                .await?
                .map(|c| c.completed == 0)
                .unwrap_or(false),
            _ => false,
        };

        let result = self
            .transact(ctx, barcode_id, |barcode| {
                self.build_scan_commit(ctx, &req, barcode, first_delivery)
            })
            .await?;

        let mut payload = json!({
            "barcode_id": result.barcode.id,
            "status": result.barcode.status,
            "event_id": result.event.id,
            "op_code": req.op_code.as_str(),
        });
        let topic = match req.scan_type {
            ScanType::Delivery => {
                // Resolve the resident behind the recipient point so the
                // notification layer can address them directly.
                if let Some(Recipient::Code(recipient)) = &result.barcode.recipient {
                    match self.directory.lookup_by_op_code(recipient).await {
                        Ok(Some(recipient_ref)) => {
                            payload["recipient_ref"] = json!(recipient_ref);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, "recipient directory lookup failed"),
                    }
                }
                "letter.delivered"
            }
            _ => "letter.scanned",
        };
        self.notify(topic, payload).await;
        Ok(result)
    }

    fn build_scan_commit(
        &self,
        ctx: &OpContext,
        req: &ScanRequest,
        barcode: &Barcode,
        first_delivery: bool,
    ) -> CoreResult<TransitionCommit> {
        let is_drift = matches!(barcode.recipient, Some(Recipient::Public));

        // Drift letters must land on a concrete recipient at delivery; the
        // courier supplies it in the scan metadata.
        let substituted = if is_drift && req.scan_type == ScanType::Delivery {
            let raw = req
                .metadata
                .get("final_recipient")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    CoreError::bad_input(
                        "drift letter delivery requires final_recipient metadata",
                    )
                })?;
            Some(OpCode::parse(raw)?)
        } else {
            None
        };

        // Scan authority targets the letter's destination, not the scan
        // location; for a resolved drift letter that is the substitution.
        let target = match (&substituted, &barcode.recipient) {
            (Some(sub), _) => Some(sub.clone()),
            (None, Some(Recipient::Code(code))) => Some(code.clone()),
            _ => None,
        };

        let perm_ctx = PermissionContext {
            target_op_code: target,
            public_drift: is_drift && substituted.is_none(),
            sender_op_code: barcode.sender_op_code.clone(),
            sender_ref: Some(barcode.sender_ref.clone()),
            barcode_status: Some(barcode.status),
            ..Default::default()
        };
        self.permit(&ctx.actor, CoreOperation::Scan(req.scan_type), &perm_ctx)?;

        let to = req.scan_type.target_status();
        self.preflight(barcode, to)?;

        let mut metadata = match &req.metadata {
            serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
            serde_json::Value::Null => json!({}),
            other => json!({ "client": other.clone() }),
        };
        if let Some(sub) = &substituted {
            metadata["recipient_substituted"] = json!({
                "from": crate::opcode::PUBLIC_SENTINEL,
                "to": sub.as_str(),
            });
        }

        let event = NewScanEvent {
            id: req.event_id.unwrap_or_else(Uuid::new_v4),
            barcode_id: barcode.id,
            scan_type: req.scan_type,
            actor_id: ctx.actor.user_ref.clone(),
            actor_role: ctx.actor.role,
            op_code: Some(req.op_code.clone()),
            latitude: req.location.map(|(lat, _)| lat),
            longitude: req.location.map(|(_, lon)| lon),
            user_agent: ctx.user_agent.clone(),
            ip: ctx.ip.clone(),
            metadata,
        };

        let mut commit = TransitionCommit::new(barcode.id, barcode.status, to, event);
        commit.scanned_by_courier = ctx.actor.courier.as_ref().map(|c| c.id);
        commit.set_recipient = substituted.map(Recipient::Code);

        if req.scan_type == ScanType::Delivery {
            commit.complete_task = true;
            if !self.config.credit.post_commit {
                commit.grants = self.delivery_grants(ctx, barcode, first_delivery);
            }
        }
        Ok(commit)
    }

    fn delivery_grants(
        &self,
        ctx: &OpContext,
        barcode: &Barcode,
        first_delivery: bool,
    ) -> Vec<PendingGrant> {
        let mut pendings = Vec::new();
        pendings.push(self.credit.pending(&barcode.sender_ref, CreditEventKind::LetterDelivered));
        if ctx.actor.courier.is_some() {
            pendings.push(
                self.credit
                    .pending(&ctx.actor.user_ref, CreditEventKind::CourierDelivery),
            );
            if first_delivery {
                pendings.push(
                    self.credit
                        .pending(&ctx.actor.user_ref, CreditEventKind::CourierFirstDelivery),
                );
            }
        }
        pendings.into_iter().flatten().collect()
    }

    // -- cancel --------------------------------------------------------------

    /// Cancel a letter. Cancelling an already-cancelled barcode succeeds
    /// idempotently.
    pub async fn cancel(
        &self,
        ctx: &OpContext,
        barcode: BarcodeRef,
        reason: &str,
    ) -> CoreResult<Barcode> {
        let barcode_id = self.resolve(&barcode).await?;
        let current = self
            .store
            .barcode_by_id(barcode_id)
            .await?
            .ok_or_else(|| CoreError::not_found("barcode", barcode_id.to_string()))?;
        if current.status == BarcodeStatus::Cancelled {
            return Ok(current);
        }

        let window = chrono::Duration::minutes(self.config.cancel.courier_window_minutes);
        let result = self
            .transact(ctx, barcode_id, |barcode| {
                let perm_ctx = PermissionContext {
                    sender_ref: Some(barcode.sender_ref.clone()),
                    sender_op_code: barcode.sender_op_code.clone(),
                    barcode_status: Some(barcode.status),
                    last_scanned_by: barcode.last_scanned_by,
                    last_scanned_at: barcode.last_scanned_at,
                    courier_cancel_window: Some(window),
                    ..Default::default()
                };
                self.permit(&ctx.actor, CoreOperation::Cancel, &perm_ctx)?;
                self.preflight(barcode, BarcodeStatus::Cancelled)?;

                let event = NewScanEvent {
                    id: Uuid::new_v4(),
                    barcode_id: barcode.id,
                    scan_type: ScanType::Cancel,
                    actor_id: ctx.actor.user_ref.clone(),
                    actor_role: ctx.actor.role,
                    op_code: None,
                    latitude: None,
                    longitude: None,
                    user_agent: ctx.user_agent.clone(),
                    ip: ctx.ip.clone(),
                    metadata: json!({ "reason": reason }),
                };
                let mut commit = TransitionCommit::new(
                    barcode.id,
                    barcode.status,
                    BarcodeStatus::Cancelled,
                    event,
                );
                commit.fail_task = true;
                Ok(commit)
            })
            .await?;

        self.notify(
            "letter.cancelled",
            json!({ "barcode_id": result.barcode.id, "reason": reason }),
        )
        .await;
        Ok(result.barcode)
    }

    // -- system transitions (scheduler-driven) -------------------------------

    /// Expire a never-bound barcode. System operation: no oracle consult.
    pub async fn expire(&self, barcode_id: Uuid) -> CoreResult<Barcode> {
        let ctx = system_context();
        let result = self
            .transact(&ctx, barcode_id, |barcode| {
                self.preflight(barcode, BarcodeStatus::Expired)?;
                let event = NewScanEvent {
                    id: Uuid::new_v4(),
                    barcode_id: barcode.id,
                    scan_type: ScanType::Expire,
                    actor_id: "system".to_string(),
                    actor_role: Role::System,
                    op_code: None,
                    latitude: None,
                    longitude: None,
                    user_agent: None,
                    ip: None,
                    metadata: json!({ "reason": "stale_unbound" }),
                };
                Ok(TransitionCommit::new(
                    barcode.id,
                    barcode.status,
                    BarcodeStatus::Expired,
                    event,
                ))
            })
            .await?;

        self.notify(
            "letter.expired",
            json!({
                "barcode_id": result.barcode.id,
                "sender_ref": result.barcode.sender_ref,
            }),
        )
        .await;
        Ok(result.barcode)
    }

    /// Unlock a future letter whose `release_at` has passed. The caller has
    /// verified a recipient is present.
    pub async fn release_future(&self, barcode_id: Uuid) -> CoreResult<Barcode> {
        let ctx = system_context();
        let result = self
            .transact(&ctx, barcode_id, |barcode| {
                if barcode.recipient.is_none() {
                    return Err(CoreError::Conflict(
                        "future letter has no recipient; surfacing for user action".to_string(),
                    ));
                }
                self.preflight(barcode, BarcodeStatus::Bound)?;
                let event = NewScanEvent {
                    id: Uuid::new_v4(),
                    barcode_id: barcode.id,
                    scan_type: ScanType::Bind,
                    actor_id: "system".to_string(),
                    actor_role: Role::System,
                    op_code: barcode.sender_op_code.clone(),
                    latitude: None,
                    longitude: None,
                    user_agent: None,
                    ip: None,
                    metadata: json!({ "reason": "future_release" }),
                };
                Ok(TransitionCommit::new(
                    barcode.id,
                    barcode.status,
                    BarcodeStatus::Bound,
                    event,
                ))
            })
            .await?;

        self.notify(
            "letter.released",
            json!({ "barcode_id": result.barcode.id }),
        )
        .await;
        Ok(result.barcode)
    }

    // -- reads ---------------------------------------------------------------

    pub async fn get(&self, barcode: &BarcodeRef) -> CoreResult<Barcode> {
        let id = self.resolve(barcode).await?;
        self.store
            .barcode_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("barcode", id.to_string()))
    }

    /// Newest-first page of a barcode's audit trail.
    pub async fn history(&self, barcode: &BarcodeRef, page: Page) -> CoreResult<Vec<ScanEvent>> {
        let id = self.resolve(barcode).await?;
        self.store.history(id, page).await
    }

    /// Full oldest-first event stream (lifecycle reconstruction).
    pub async fn timeline(&self, barcode: &BarcodeRef) -> CoreResult<Vec<ScanEvent>> {
        let id = self.resolve(barcode).await?;
        self.store.timeline(id).await
    }

    /// Dry-run the permission oracle for an operation against a barcode.
    pub async fn validate_operation(
        &self,
        ctx: &OpContext,
        barcode: &BarcodeRef,
        operation: CoreOperation,
    ) -> CoreResult<Decision> {
        let barcode = self.get(barcode).await?;
        let window = chrono::Duration::minutes(self.config.cancel.courier_window_minutes);
        let target = match &barcode.recipient {
            Some(Recipient::Code(code)) => Some(code.clone()),
            _ => None,
        };
        let perm_ctx = PermissionContext {
            target_op_code: target,
            public_drift: matches!(barcode.recipient, Some(Recipient::Public)),
            sender_op_code: barcode.sender_op_code.clone(),
            sender_ref: Some(barcode.sender_ref.clone()),
            barcode_status: Some(barcode.status),
            last_scanned_by: barcode.last_scanned_by,
            last_scanned_at: barcode.last_scanned_at,
            courier_cancel_window: Some(window),
            ..Default::default()
        };
        Ok(check(&ctx.actor, operation, &perm_ctx))
    }

    /// Drop terminal-barcode events past the configured retention.
    pub async fn cleanup_events(&self) -> CoreResult<u64> {
        let older_than = Utc::now() - chrono::Duration::days(self.config.scan.retention_days);
        let removed = self.store.prune_events(older_than).await?;
        if removed > 0 {
            info!(removed, "scan events pruned past retention");
        }
        Ok(removed)
    }

    // -- shared protocol pieces ----------------------------------------------

    fn permit(
        &self,
        actor: &Actor,
        operation: CoreOperation,
        perm_ctx: &PermissionContext,
    ) -> CoreResult<()> {
        match check(actor, operation, perm_ctx) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(CoreError::Forbidden(reason)),
        }
    }

    fn preflight(&self, barcode: &Barcode, to: BarcodeStatus) -> CoreResult<()> {
        if barcode.status.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: barcode.status,
                to,
            })
        }
    }

    async fn resolve(&self, barcode: &BarcodeRef) -> CoreResult<Uuid> {
        match barcode {
            BarcodeRef::Id(id) => Ok(*id),
            BarcodeRef::Code(code) => self
                .store
                .barcode_by_code(code)
                .await?
                .map(|b| b.id)
                .ok_or_else(|| CoreError::not_found("barcode", code.clone())),
        }
    }

    /// Load, permit/preflight/build (the closure), commit; reload and retry
    /// on CAS misses.
    async fn transact<F>(
        &self,
        ctx: &OpContext,
        barcode_id: Uuid,
        step: F,
    ) -> CoreResult<TransitionResult>
    where
        F: Fn(&Barcode) -> CoreResult<TransitionCommit>,
    {
        for attempt in 0..CAS_RETRIES {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::TransientUnavailable(
                    "operation cancelled".to_string(),
                ));
            }
            let barcode = self
                .store
                .barcode_by_id(barcode_id)
                .await?
                .ok_or_else(|| CoreError::not_found("barcode", barcode_id.to_string()))?;
            let mut commit = step(&barcode)?;
            let post_commit_grants = if self.config.credit.post_commit {
                std::mem::take(&mut commit.grants)
            } else {
                Vec::new()
            };
            match self.store.commit_transition(commit).await? {
                CommitOutcome::Committed {
                    barcode,
                    event,
                    mut grants,
                } => {
                    if !post_commit_grants.is_empty() {
                        grants = self.settle_grants(post_commit_grants, event.id).await;
                    }
                    return Ok(TransitionResult {
                        barcode,
                        event,
                        grants,
                    });
                }
                CommitOutcome::StatusMismatch { actual } => {
                    warn!(
                        %barcode_id,
                        attempt,
                        actual = %actual,
                        "status CAS missed, retrying"
                    );
                    let jitter = rand::thread_rng().gen_range(5..25) * (attempt as u64 + 1);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
            }
        }
        Err(CoreError::ConcurrentUpdate)
    }

    /// Apply grants outside a transition transaction (creation rewards and
    /// the post-commit mode). Cap hits log as quota events; failures are
    /// logged and swallowed in post-commit mode by design of that mode.
    async fn settle_grants(
        &self,
        pendings: Vec<PendingGrant>,
        source_event_id: Uuid,
    ) -> Vec<GrantOutcome> {
        let mut outcomes = Vec::with_capacity(pendings.len());
        for pending in pendings {
            let user_ref = pending.user_ref.clone();
            let kind = pending.kind;
            match self.store.apply_grant(pending, source_event_id).await {
                Ok(outcome) => {
                    if matches!(outcome, GrantOutcome::CapReached) {
                        info!(
                            %user_ref,
                            task_type = kind.as_str(),
                            "credit cap reached; grant skipped"
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(err) => {
                    warn!(%user_ref, task_type = kind.as_str(), %err, "credit grant failed");
                }
            }
        }
        outcomes
    }

    async fn notify(&self, topic: &str, payload: serde_json::Value) {
        if let Err(err) = self.notifier.publish(topic, payload).await {
            warn!(topic, %err, "notification publish failed");
        }
    }
}

fn system_context() -> OpContext {
    OpContext::new(Actor {
        user_ref: "system".to_string(),
        role: Role::System,
        courier: None,
    })
}
