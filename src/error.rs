//! Typed errors for the lifecycle core
//!
//! Every error kind maps to exactly one transport-layer code. The transport
//! adapter (out of scope here) performs that mapping; the core only promises
//! the kinds stay stable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::barcode::BarcodeStatus;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Enumerated reasons the permission oracle can deny an operation.
///
/// Reason codes are what the actor is entitled to see; they never carry
/// the target's private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Actor is not the original sender of the letter
    NotSender,
    /// Operation is reserved to the sender
    SenderOnly,
    /// Operation requires a courier role
    CourierRequired,
    /// Target OP-Code falls outside the courier's managed prefix
    OutOfScope,
    /// Courier level is below the minimum for this operation
    LevelTooLow,
    /// Courier may only manage the level directly beneath their own
    WrongLevel,
    /// Child prefix does not extend the parent's managed prefix
    PrefixMismatch,
    /// The time window for this operation has closed
    WindowExpired,
    /// Operation is reserved to administrators
    AdminOnly,
    /// Courier account is suspended or resigned
    SuspendedCourier,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NotSender => "not_sender",
            DenyReason::SenderOnly => "sender_only",
            DenyReason::CourierRequired => "courier_required",
            DenyReason::OutOfScope => "out_of_scope",
            DenyReason::LevelTooLow => "level_too_low",
            DenyReason::WrongLevel => "wrong_level",
            DenyReason::PrefixMismatch => "prefix_mismatch",
            DenyReason::WindowExpired => "window_expired",
            DenyReason::AdminOnly => "admin_only",
            DenyReason::SuspendedCourier => "suspended_courier",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error kinds
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(DenyReason),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: BarcodeStatus,
        to: BarcodeStatus,
    },

    #[error("concurrent update: status CAS retries exhausted")]
    ConcurrentUpdate,

    #[error("barcode code already exists: {code}")]
    CodeCollision { code: String },

    #[error("unique code generation exhausted after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error("backend temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("quota exceeded for {user_ref}/{task_type}")]
    QuotaExceeded { user_ref: String, task_type: String },

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        CoreError::BadInput(msg.into())
    }

    /// Whether the caller may safely retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrentUpdate
                | CoreError::CodeCollision { .. }
                | CoreError::TransientUnavailable(_)
        )
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::not_found("row", "?"),
            other => CoreError::Storage(other.to_string()),
        }
    }
}
