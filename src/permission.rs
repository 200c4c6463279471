//! Permission oracle
//!
//! A pure decision function over (actor role, courier level, managed prefix,
//! operation, target op-code). The courier tree is data, not a class
//! hierarchy: prefix containment is the entire scoping semantics, so nothing
//! here touches the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::barcode::{BarcodeStatus, ScanType};
use crate::courier::{CourierLevel, CourierStatus};
use crate::error::DenyReason;
use crate::opcode::{OpCode, OpCodePrefix};

/// Actor role as asserted by the (external) authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Courier,
    Admin,
    PlatformAdmin,
    SuperAdmin,
    /// Scheduler-driven transitions (expiry, future-letter release).
    System,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::PlatformAdmin | Role::SuperAdmin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Courier => "courier",
            Role::Admin => "admin",
            Role::PlatformAdmin => "platform_admin",
            Role::SuperAdmin => "super_admin",
            Role::System => "system",
        }
    }
}

/// Courier identity attached to an actor, resolved by the caller from the
/// courier tree before the check.
#[derive(Debug, Clone)]
pub struct CourierIdentity {
    pub id: Uuid,
    pub level: CourierLevel,
    pub managed_prefix: OpCodePrefix,
    pub status: CourierStatus,
}

/// The acting principal for one core operation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_ref: String,
    pub role: Role,
    pub courier: Option<CourierIdentity>,
}

impl Actor {
    pub fn user(user_ref: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            role: Role::User,
            courier: None,
        }
    }

    pub fn admin(user_ref: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            role: Role::Admin,
            courier: None,
        }
    }

    pub fn courier(user_ref: impl Into<String>, identity: CourierIdentity) -> Self {
        Self {
            user_ref: user_ref.into(),
            role: Role::Courier,
            courier: Some(identity),
        }
    }

    fn active_courier(&self) -> Option<&CourierIdentity> {
        self.courier
            .as_ref()
            .filter(|c| c.status == CourierStatus::Active)
    }
}

/// Operations the oracle arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreOperation {
    CreateBarcode,
    BatchGenerate,
    Bind,
    Scan(ScanType),
    Cancel,
    CreateCourier { level: CourierLevel },
    AssignTask,
    RegisterSchedule,
}

/// Per-operation facts the oracle consults. All fields optional; rules that
/// need a missing fact deny conservatively.
#[derive(Debug, Clone, Default)]
pub struct PermissionContext {
    /// OP-Code the operation targets: the letter's recipient destination for
    /// scans (or the substituted recipient for drift deliveries).
    pub target_op_code: Option<OpCode>,
    /// Set when the letter is still `PUBLIC`-bound: scan scope falls back to
    /// school-wide coverage of the sender's OP-Code.
    pub public_drift: bool,
    /// The letter's sender OP-Code (bind scoping, PUBLIC coverage).
    pub sender_op_code: Option<OpCode>,
    /// The letter sender's user reference.
    pub sender_ref: Option<String>,
    pub barcode_status: Option<BarcodeStatus>,
    pub last_scanned_by: Option<Uuid>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub now: Option<DateTime<Utc>>,
    /// Window in which the last scanning courier may cancel.
    pub courier_cancel_window: Option<Duration>,
}

impl PermissionContext {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

/// Oracle verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decide whether `actor` may perform `operation` under `ctx`.
pub fn check(actor: &Actor, operation: CoreOperation, ctx: &PermissionContext) -> Decision {
    // Admin tiers bypass scoping entirely; super_admin additionally crosses
    // school boundaries, which no rule below distinguishes further.
    if actor.role.is_admin() {
        return Decision::Allow;
    }

    match operation {
        CoreOperation::CreateBarcode => Decision::Allow,

        CoreOperation::BatchGenerate => match actor.active_courier() {
            Some(c) if c.level >= CourierLevel::School => Decision::Allow,
            Some(_) => Decision::Deny(DenyReason::LevelTooLow),
            None => Decision::Deny(DenyReason::CourierRequired),
        },

        CoreOperation::Bind => check_bind(actor, ctx),

        CoreOperation::Scan(scan_type) => check_scan(actor, scan_type, ctx),

        CoreOperation::Cancel => check_cancel(actor, ctx),

        CoreOperation::CreateCourier { level } => check_create_courier(actor, level),

        CoreOperation::AssignTask => match actor.active_courier() {
            Some(_) => Decision::Allow,
            None => Decision::Deny(DenyReason::CourierRequired),
        },

        CoreOperation::RegisterSchedule => Decision::Deny(DenyReason::AdminOnly),
    }
}

/// Bind: the original sender, or a courier whose prefix covers the sender's
/// OP-Code (drop-box intake).
fn check_bind(actor: &Actor, ctx: &PermissionContext) -> Decision {
    if ctx.sender_ref.as_deref() == Some(actor.user_ref.as_str()) {
        return Decision::Allow;
    }
    match (actor.active_courier(), &ctx.sender_op_code) {
        (Some(c), Some(sender)) if c.managed_prefix.covers(sender) => Decision::Allow,
        (Some(_), _) => Decision::Deny(DenyReason::OutOfScope),
        (None, _) => Decision::Deny(DenyReason::NotSender),
    }
}

/// Physical scans are courier-only and scoped by prefix containment.
fn check_scan(actor: &Actor, scan_type: ScanType, ctx: &PermissionContext) -> Decision {
    if !scan_type.is_physical_scan() {
        // bind/cancel/expire arrive through their own operations
        return Decision::Deny(DenyReason::AdminOnly);
    }
    let courier = match actor.courier.as_ref() {
        Some(c) => c,
        None => return Decision::Deny(DenyReason::CourierRequired),
    };
    if courier.status != CourierStatus::Active {
        return Decision::Deny(DenyReason::SuspendedCourier);
    }
    if ctx.public_drift {
        // No concrete destination yet: school-wide couriers of the sender's
        // school may carry the letter.
        return match &ctx.sender_op_code {
            Some(sender) if courier.managed_prefix.covers_public(sender) => Decision::Allow,
            _ => Decision::Deny(DenyReason::OutOfScope),
        };
    }
    let target = match &ctx.target_op_code {
        Some(t) => t,
        None => return Decision::Deny(DenyReason::OutOfScope),
    };
    if courier.managed_prefix.covers(target) {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::OutOfScope)
    }
}

/// Cancel: sender before transit; the last scanning courier within the
/// configured window; admins always (handled above).
fn check_cancel(actor: &Actor, ctx: &PermissionContext) -> Decision {
    if ctx.sender_ref.as_deref() == Some(actor.user_ref.as_str()) {
        return match ctx.barcode_status {
            Some(BarcodeStatus::Unactivated) | Some(BarcodeStatus::Bound) => Decision::Allow,
            Some(_) => Decision::Deny(DenyReason::WindowExpired),
            None => Decision::Deny(DenyReason::WindowExpired),
        };
    }

    let courier = match actor.active_courier() {
        Some(c) => c,
        None => return Decision::Deny(DenyReason::NotSender),
    };
    if ctx.last_scanned_by != Some(courier.id) {
        return Decision::Deny(DenyReason::NotSender);
    }
    match (ctx.last_scanned_at, ctx.courier_cancel_window) {
        (Some(at), Some(window)) if ctx.now() - at <= window => Decision::Allow,
        _ => Decision::Deny(DenyReason::WindowExpired),
    }
}

/// A courier may create couriers exactly one level beneath their own.
/// Only admins create city (L4) roots.
fn check_create_courier(actor: &Actor, level: CourierLevel) -> Decision {
    if level == CourierLevel::City {
        return Decision::Deny(DenyReason::AdminOnly);
    }
    let courier = match actor.active_courier() {
        Some(c) => c,
        None => return Decision::Deny(DenyReason::CourierRequired),
    };
    match courier.level.child() {
        Some(child_level) if child_level == level => Decision::Allow,
        _ => Decision::Deny(DenyReason::WrongLevel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn courier_actor(level: CourierLevel, prefix: &str) -> Actor {
        Actor::courier(
            format!("courier-{prefix}"),
            CourierIdentity {
                id: Uuid::new_v4(),
                level,
                managed_prefix: OpCodePrefix::parse(prefix).expect("valid prefix"),
                status: CourierStatus::Active,
            },
        )
    }

    fn scan_ctx(target: &str) -> PermissionContext {
        PermissionContext {
            target_op_code: Some(OpCode::parse(target).expect("valid code")),
            ..Default::default()
        }
    }

    #[test]
    fn admin_allows_everything() {
        let admin = Actor::admin("root");
        for op in [
            CoreOperation::CreateBarcode,
            CoreOperation::BatchGenerate,
            CoreOperation::Bind,
            CoreOperation::Scan(ScanType::Delivery),
            CoreOperation::Cancel,
            CoreOperation::CreateCourier {
                level: CourierLevel::City,
            },
            CoreOperation::RegisterSchedule,
        ] {
            assert!(check(&admin, op, &PermissionContext::default()).is_allowed());
        }
    }

    #[test]
    fn courier_scan_scoped_by_prefix() {
        let bob = courier_actor(CourierLevel::Building, "PK5F3D");
        assert!(check(&bob, CoreOperation::Scan(ScanType::Delivery), &scan_ctx("PK5F3D")).is_allowed());

        let dan = courier_actor(CourierLevel::Building, "PK5F99");
        assert_eq!(
            check(&dan, CoreOperation::Scan(ScanType::Delivery), &scan_ctx("PK5F3D")),
            Decision::Deny(DenyReason::OutOfScope)
        );
    }

    #[test]
    fn suspended_courier_cannot_scan() {
        let mut actor = courier_actor(CourierLevel::Area, "PK5F");
        if let Some(c) = actor.courier.as_mut() {
            c.status = CourierStatus::Suspended;
        }
        assert_eq!(
            check(&actor, CoreOperation::Scan(ScanType::Pickup), &scan_ctx("PK5F01")),
            Decision::Deny(DenyReason::SuspendedCourier)
        );
    }

    #[test]
    fn drift_scan_falls_back_to_school_scope() {
        let ctx = PermissionContext {
            public_drift: true,
            sender_op_code: Some(OpCode::parse("PK5F01").expect("valid code")),
            ..Default::default()
        };
        let school = courier_actor(CourierLevel::School, "PK");
        assert!(check(&school, CoreOperation::Scan(ScanType::Pickup), &ctx).is_allowed());

        // Building-level scope is too narrow for an unresolved recipient.
        let building = courier_actor(CourierLevel::Building, "PK5F3D");
        assert_eq!(
            check(&building, CoreOperation::Scan(ScanType::Pickup), &ctx),
            Decision::Deny(DenyReason::OutOfScope)
        );
    }

    #[test]
    fn plain_user_cannot_scan() {
        let alice = Actor::user("alice");
        assert_eq!(
            check(&alice, CoreOperation::Scan(ScanType::Pickup), &scan_ctx("PK5F01")),
            Decision::Deny(DenyReason::CourierRequired)
        );
    }

    #[test]
    fn bind_by_sender_or_covering_courier() {
        let ctx = PermissionContext {
            sender_ref: Some("alice".to_string()),
            sender_op_code: Some(OpCode::parse("PK5F01").expect("valid code")),
            ..Default::default()
        };
        assert!(check(&Actor::user("alice"), CoreOperation::Bind, &ctx).is_allowed());
        assert_eq!(
            check(&Actor::user("mallory"), CoreOperation::Bind, &ctx),
            Decision::Deny(DenyReason::NotSender)
        );

        let local = courier_actor(CourierLevel::Area, "PK5F");
        assert!(check(&local, CoreOperation::Bind, &ctx).is_allowed());
        let remote = courier_actor(CourierLevel::Area, "QH11");
        assert_eq!(
            check(&remote, CoreOperation::Bind, &ctx),
            Decision::Deny(DenyReason::OutOfScope)
        );
    }

    #[test]
    fn sender_cancel_blocked_after_pickup() {
        let ctx = |status| PermissionContext {
            sender_ref: Some("alice".to_string()),
            barcode_status: Some(status),
            ..Default::default()
        };
        let alice = Actor::user("alice");
        assert!(check(&alice, CoreOperation::Cancel, &ctx(BarcodeStatus::Bound)).is_allowed());
        assert_eq!(
            check(&alice, CoreOperation::Cancel, &ctx(BarcodeStatus::InTransit)),
            Decision::Deny(DenyReason::WindowExpired)
        );
    }

    #[test]
    fn last_scanner_cancel_window() {
        let actor = courier_actor(CourierLevel::Building, "PK5F3D");
        let courier_id = actor.courier.as_ref().map(|c| c.id).expect("courier id");
        let now = Utc::now();

        let mut ctx = PermissionContext {
            sender_ref: Some("alice".to_string()),
            barcode_status: Some(BarcodeStatus::InTransit),
            last_scanned_by: Some(courier_id),
            last_scanned_at: Some(now - Duration::minutes(5)),
            now: Some(now),
            courier_cancel_window: Some(Duration::minutes(10)),
            ..Default::default()
        };
        assert!(check(&actor, CoreOperation::Cancel, &ctx).is_allowed());

        ctx.last_scanned_at = Some(now - Duration::minutes(11));
        assert_eq!(
            check(&actor, CoreOperation::Cancel, &ctx),
            Decision::Deny(DenyReason::WindowExpired)
        );

        // A different courier gets no window at all.
        ctx.last_scanned_by = Some(Uuid::new_v4());
        ctx.last_scanned_at = Some(now);
        assert_eq!(
            check(&actor, CoreOperation::Cancel, &ctx),
            Decision::Deny(DenyReason::NotSender)
        );
    }

    #[test]
    fn batch_generate_needs_level_three() {
        let l2 = courier_actor(CourierLevel::Area, "PK5F");
        assert_eq!(
            check(&l2, CoreOperation::BatchGenerate, &PermissionContext::default()),
            Decision::Deny(DenyReason::LevelTooLow)
        );
        let l3 = courier_actor(CourierLevel::School, "PK");
        assert!(check(&l3, CoreOperation::BatchGenerate, &PermissionContext::default()).is_allowed());
    }

    #[test]
    fn courier_creation_one_level_down_only() {
        let l3 = courier_actor(CourierLevel::School, "PK");
        assert!(check(
            &l3,
            CoreOperation::CreateCourier {
                level: CourierLevel::Area
            },
            &PermissionContext::default()
        )
        .is_allowed());
        assert_eq!(
            check(
                &l3,
                CoreOperation::CreateCourier {
                    level: CourierLevel::Building
                },
                &PermissionContext::default()
            ),
            Decision::Deny(DenyReason::WrongLevel)
        );
        assert_eq!(
            check(
                &l3,
                CoreOperation::CreateCourier {
                    level: CourierLevel::School
                },
                &PermissionContext::default()
            ),
            Decision::Deny(DenyReason::WrongLevel)
        );
        // L4 roots are admin-only even for city couriers.
        let l4 = courier_actor(CourierLevel::City, "PK");
        assert_eq!(
            check(
                &l4,
                CoreOperation::CreateCourier {
                    level: CourierLevel::City
                },
                &PermissionContext::default()
            ),
            Decision::Deny(DenyReason::AdminOnly)
        );
    }
}
