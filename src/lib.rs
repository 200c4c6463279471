//! OpenPenPal core — letter-lifecycle coordination engine
//!
//! The interlocking machinery behind the campus mail network: the barcode
//! state machine, the append-only scan-event pipeline, OP-Code routing, the
//! 4-level courier hierarchy, leader-free distributed scheduling, and the
//! idempotent credit ledger. Transport, authentication, AI matching and
//! notification delivery are external collaborators behind the seams in
//! [`collaborators`].
//!
//! Entry point for integrators is [`engine::CoreEngine`]; the individual
//! subsystems are usable on their own.

pub mod barcode;
pub mod collaborators;
pub mod config;
pub mod courier;
pub mod credit;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod opcode;
pub mod permission;
pub mod scheduler;
pub mod store;
pub mod task;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "redis")]
pub mod redis_lock;

pub use barcode::{Barcode, BarcodeStatus, Page, ScanEvent, ScanType};
pub use config::CoreConfig;
pub use courier::{Courier, CourierLevel, CourierStatus};
pub use credit::{CreditEventKind, CreditGrant, CreditRule};
pub use engine::{Collaborators, CoreEngine};
pub use error::{CoreError, CoreResult, DenyReason};
pub use lifecycle::{BarcodeRef, LifecycleCoordinator, OpContext, ScanRequest};
pub use opcode::{OpCode, OpCodePrefix, Recipient};
pub use permission::{Actor, CoreOperation, CourierIdentity, Decision, Role};
pub use store::{CoreStore, MemoryStore};
pub use task::{DeliveryTask, TaskState};
