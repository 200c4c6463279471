//! Core engine façade
//!
//! Wires the coordinator, courier registry, dispatcher, lock manager and
//! scheduler over one store and exposes exactly the operations the
//! transport layer consumes. Transport, authentication and notification
//! delivery stay outside; callers hand in an [`Actor`] their auth layer
//! already established.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::barcode::{Barcode, Page, ScanEvent};
use crate::collaborators::{AiMatcher, LogNotifier, Notifier, NullDirectory, NullMatcher, UserDirectory};
use crate::config::CoreConfig;
use crate::courier::{Courier, CourierLevel, CourierRegistry};
use crate::dispatch::TaskDispatcher;
use crate::error::{CoreError, CoreResult, DenyReason};
use crate::lifecycle::{BarcodeRef, LifecycleCoordinator, OpContext, ScanRequest, TransitionResult};
use crate::lock::{LeaseStore, LockManager};
use crate::opcode::{OpCode, OpCodePrefix, Recipient};
use crate::permission::{Actor, CoreOperation, CourierIdentity, Decision, Role};
use crate::scheduler::handlers::BuiltinJobs;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::store::CoreStore;
use crate::task::DeliveryTask;

/// External collaborator endpoints; defaults are inert stand-ins.
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub matcher: Arc<dyn AiMatcher>,
    pub directory: Arc<dyn UserDirectory>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            matcher: Arc::new(NullMatcher),
            directory: Arc::new(NullDirectory),
        }
    }
}

pub struct CoreEngine {
    store: Arc<dyn CoreStore>,
    locks: Arc<LockManager>,
    lifecycle: Arc<LifecycleCoordinator>,
    dispatcher: Arc<TaskDispatcher>,
    registry: CourierRegistry,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
}

impl CoreEngine {
    pub fn new(
        store: Arc<dyn CoreStore>,
        leases: Arc<dyn LeaseStore>,
        config: CoreConfig,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        let credit = config.credit.build_engine()?;
        let locks = Arc::new(LockManager::new(leases, config.lock.clone()));
        let lifecycle = Arc::new(LifecycleCoordinator::new(
            Arc::clone(&store),
            credit,
            Arc::clone(&collaborators.notifier),
            Arc::clone(&collaborators.directory),
            config.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.notifier),
            config.courier.clone(),
        ));
        let registry = CourierRegistry::new(Arc::clone(&store), Arc::clone(&locks));

        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            config.scheduler.clone(),
            shutdown.clone(),
        );
        BuiltinJobs {
            store: Arc::clone(&store),
            lifecycle: Arc::clone(&lifecycle),
            dispatcher: Arc::clone(&dispatcher),
            matcher: Arc::clone(&collaborators.matcher),
            notifier: Arc::clone(&collaborators.notifier),
        }
        .register(&mut scheduler);

        Ok(Self {
            store,
            locks,
            lifecycle,
            dispatcher,
            registry,
            scheduler: Arc::new(scheduler),
            shutdown,
        })
    }

    /// Install the built-in schedules and the `scheduler.jobs.*` config
    /// entries, then return the scheduler for the caller to run.
    pub async fn bootstrap_schedules(&self) -> CoreResult<Arc<Scheduler>> {
        for spec in BuiltinJobs::default_schedules()? {
            if self.store.schedule_by_id(&spec.id).await?.is_none() {
                self.store.upsert_schedule(spec).await?;
            }
        }
        self.scheduler.load_jobs_from_config().await?;
        Ok(Arc::clone(&self.scheduler))
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn lifecycle(&self) -> Arc<LifecycleCoordinator> {
        Arc::clone(&self.lifecycle)
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn locks(&self) -> Arc<LockManager> {
        Arc::clone(&self.locks)
    }

    /// Signal graceful shutdown to the scheduler and in-flight handlers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Rebuild an [`Actor`] from an authenticated principal, attaching the
    /// courier identity when one exists.
    pub async fn resolve_actor(&self, user_ref: &str, role: Role) -> CoreResult<Actor> {
        let courier = self
            .store
            .courier_by_user(user_ref)
            .await?
            .map(|c| CourierIdentity {
                id: c.id,
                level: c.level,
                managed_prefix: c.managed_prefix,
                status: c.status,
            });
        Ok(Actor {
            user_ref: user_ref.to_string(),
            role,
            courier,
        })
    }

    // -- barcode operations --------------------------------------------------

    pub async fn create_barcode(
        &self,
        ctx: &OpContext,
        letter_ref: Option<String>,
        sender_op_code: Option<OpCode>,
        release_at: Option<DateTime<Utc>>,
    ) -> CoreResult<Barcode> {
        self.lifecycle
            .create(ctx, letter_ref, sender_op_code, release_at)
            .await
    }

    pub async fn bulk_create_barcodes(
        &self,
        ctx: &OpContext,
        count: usize,
    ) -> CoreResult<Vec<Barcode>> {
        self.lifecycle.bulk_create(ctx, count).await
    }

    pub async fn bind_barcode(
        &self,
        ctx: &OpContext,
        barcode: BarcodeRef,
        recipient: Recipient,
        envelope_ref: Option<String>,
    ) -> CoreResult<Barcode> {
        self.lifecycle.bind(ctx, barcode, recipient, envelope_ref).await
    }

    pub async fn scan(&self, ctx: &OpContext, req: ScanRequest) -> CoreResult<TransitionResult> {
        self.lifecycle.scan(ctx, req).await
    }

    pub async fn cancel_barcode(
        &self,
        ctx: &OpContext,
        barcode: BarcodeRef,
        reason: &str,
    ) -> CoreResult<Barcode> {
        self.lifecycle.cancel(ctx, barcode, reason).await
    }

    pub async fn get_barcode(&self, barcode: &BarcodeRef) -> CoreResult<Barcode> {
        self.lifecycle.get(barcode).await
    }

    pub async fn get_history(
        &self,
        barcode: &BarcodeRef,
        page: Page,
    ) -> CoreResult<Vec<ScanEvent>> {
        self.lifecycle.history(barcode, page).await
    }

    pub async fn validate_operation(
        &self,
        ctx: &OpContext,
        barcode: &BarcodeRef,
        operation: CoreOperation,
    ) -> CoreResult<Decision> {
        self.lifecycle.validate_operation(ctx, barcode, operation).await
    }

    // -- courier operations --------------------------------------------------

    /// Create a courier. City roots take no parent and are admin-only; every
    /// other level requires the parent node, and a non-admin creator must be
    /// that parent.
    pub async fn create_courier(
        &self,
        ctx: &OpContext,
        parent: Option<Uuid>,
        level: CourierLevel,
        prefix: OpCodePrefix,
        user_ref: &str,
    ) -> CoreResult<Courier> {
        let decision = crate::permission::check(
            &ctx.actor,
            CoreOperation::CreateCourier { level },
            &Default::default(),
        );
        if let Decision::Deny(reason) = decision {
            return Err(CoreError::Forbidden(reason));
        }

        match (level, parent) {
            (CourierLevel::City, None) => self.registry.create_root(prefix, user_ref).await,
            (CourierLevel::City, Some(_)) => Err(CoreError::bad_input(
                "city roots take no parent",
            )),
            (_, None) => Err(CoreError::bad_input(format!(
                "level {} couriers require a parent",
                level.as_u8()
            ))),
            (_, Some(parent_id)) => {
                if !ctx.actor.role.is_admin() {
                    let creator = ctx
                        .actor
                        .courier
                        .as_ref()
                        .ok_or(CoreError::Forbidden(DenyReason::CourierRequired))?;
                    if creator.id != parent_id {
                        return Err(CoreError::Forbidden(DenyReason::PrefixMismatch));
                    }
                }
                self.registry
                    .create_child(parent_id, level, prefix, user_ref)
                    .await
            }
        }
    }

    /// Soft-resign a courier; admins, or the courier resigning themself.
    pub async fn resign_courier(&self, ctx: &OpContext, courier_id: Uuid) -> CoreResult<Courier> {
        if !ctx.actor.role.is_admin() {
            let own = ctx.actor.courier.as_ref().map(|c| c.id);
            if own != Some(courier_id) {
                return Err(CoreError::Forbidden(DenyReason::AdminOnly));
            }
        }
        self.registry.resign(courier_id).await
    }

    pub async fn get_courier(&self, courier_id: Uuid) -> CoreResult<Courier> {
        self.store
            .courier_by_id(courier_id)
            .await?
            .ok_or_else(|| CoreError::not_found("courier", courier_id.to_string()))
    }

    // -- task operations -----------------------------------------------------

    pub async fn assign_task(
        &self,
        ctx: &OpContext,
        barcode: BarcodeRef,
        pickup: OpCode,
        dropoff: OpCode,
        deadline: Option<DateTime<Utc>>,
    ) -> CoreResult<DeliveryTask> {
        let decision = crate::permission::check(
            &ctx.actor,
            CoreOperation::AssignTask,
            &Default::default(),
        );
        if let Decision::Deny(reason) = decision {
            return Err(CoreError::Forbidden(reason));
        }
        let barcode = self.lifecycle.get(&barcode).await?;
        self.dispatcher
            .create_task(barcode.id, pickup, dropoff, deadline)
            .await
    }

    // -- scheduler operations ------------------------------------------------

    pub async fn register_scheduled_task(
        &self,
        ctx: &OpContext,
        spec: ScheduledTask,
    ) -> CoreResult<String> {
        let decision = crate::permission::check(
            &ctx.actor,
            CoreOperation::RegisterSchedule,
            &Default::default(),
        );
        if let Decision::Deny(reason) = decision {
            return Err(CoreError::Forbidden(reason));
        }
        self.scheduler.register_task(spec).await
    }
}
