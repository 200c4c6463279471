//! Barcode model, status machine, and scan events
//!
//! A barcode is the unit of physical tracking: the printable code stuck to a
//! letter is the only durable identifier on physical mail. Its status moves
//! through an explicit state machine; every permitted change is witnessed by
//! exactly one immutable scan event.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::opcode::{OpCode, Recipient};
use crate::permission::Role;

// ============================================================================
// Status machine
// ============================================================================

/// Barcode lifecycle status. Matches the DB `status` column (snake_case text).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeStatus {
    Unactivated,
    Bound,
    InTransit,
    Delivered,
    Expired,
    Cancelled,
}

impl BarcodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarcodeStatus::Unactivated => "unactivated",
            BarcodeStatus::Bound => "bound",
            BarcodeStatus::InTransit => "in_transit",
            BarcodeStatus::Delivered => "delivered",
            BarcodeStatus::Expired => "expired",
            BarcodeStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BarcodeStatus::Delivered | BarcodeStatus::Expired | BarcodeStatus::Cancelled
        )
    }

    /// The allowed-transitions table. `in_transit -> in_transit` is a
    /// permitted re-scan (inter-courier transfer).
    pub fn can_transition(self, to: BarcodeStatus) -> bool {
        use BarcodeStatus::*;
        matches!(
            (self, to),
            (Unactivated, Bound)
                | (Unactivated, Expired)
                | (Unactivated, Cancelled)
                | (Bound, InTransit)
                | (Bound, Cancelled)
                | (InTransit, InTransit)
                | (InTransit, Delivered)
                | (InTransit, Cancelled)
        )
    }
}

impl std::str::FromStr for BarcodeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unactivated" => Ok(BarcodeStatus::Unactivated),
            "bound" => Ok(BarcodeStatus::Bound),
            "in_transit" => Ok(BarcodeStatus::InTransit),
            "delivered" => Ok(BarcodeStatus::Delivered),
            "expired" => Ok(BarcodeStatus::Expired),
            "cancelled" => Ok(BarcodeStatus::Cancelled),
            other => Err(CoreError::bad_input(format!(
                "unknown barcode status: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for BarcodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of physical (or system) interaction witnessed by a scan event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Bind,
    Pickup,
    Transit,
    Delivery,
    Cancel,
    /// System-driven expiry of a never-bound barcode.
    Expire,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Bind => "bind",
            ScanType::Pickup => "pickup",
            ScanType::Transit => "transit",
            ScanType::Delivery => "delivery",
            ScanType::Cancel => "cancel",
            ScanType::Expire => "expire",
        }
    }

    /// The status this scan kind drives the barcode toward.
    pub fn target_status(&self) -> BarcodeStatus {
        match self {
            ScanType::Bind => BarcodeStatus::Bound,
            ScanType::Pickup | ScanType::Transit => BarcodeStatus::InTransit,
            ScanType::Delivery => BarcodeStatus::Delivered,
            ScanType::Cancel => BarcodeStatus::Cancelled,
            ScanType::Expire => BarcodeStatus::Expired,
        }
    }

    /// Physical courier scans bump `scan_count`; bind and system events do not.
    pub fn is_physical_scan(&self) -> bool {
        matches!(self, ScanType::Pickup | ScanType::Transit | ScanType::Delivery)
    }
}

impl std::str::FromStr for ScanType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(ScanType::Bind),
            "pickup" => Ok(ScanType::Pickup),
            "transit" => Ok(ScanType::Transit),
            "delivery" => Ok(ScanType::Delivery),
            "cancel" => Ok(ScanType::Cancel),
            "expire" => Ok(ScanType::Expire),
            other => Err(CoreError::bad_input(format!("unknown scan type: {other:?}"))),
        }
    }
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Barcode
// ============================================================================

/// A tracked barcode. `letter_ref` and `envelope_ref` are opaque references
/// to content owned by collaborating services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barcode {
    pub id: Uuid,
    /// Printable short code, globally unique. The only identifier that
    /// survives on physical mail.
    pub code: String,
    /// Opaque reference to the letter content; absent for pre-printed batch
    /// stickers until a letter is attached at binding.
    pub letter_ref: Option<String>,
    pub status: BarcodeStatus,
    /// Creator's user reference (the sender).
    pub sender_ref: String,
    pub sender_op_code: Option<OpCode>,
    /// Set at binding; `PUBLIC` for drift letters until delivery rewrites it.
    pub recipient: Option<Recipient>,
    pub envelope_ref: Option<String>,
    /// Future-letter unlock instant; the scheduler binds the letter once past.
    pub release_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub bound_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    /// Courier id of the most recent physical scan.
    pub last_scanned_by: Option<Uuid>,
    pub scan_count: i32,
}

impl Barcode {
    pub fn new(code: String, letter_ref: Option<String>, sender_ref: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            letter_ref,
            status: BarcodeStatus::Unactivated,
            sender_ref,
            sender_op_code: None,
            recipient: None,
            envelope_ref: None,
            release_at: None,
            created_at: Utc::now(),
            bound_at: None,
            delivered_at: None,
            last_scanned_at: None,
            last_scanned_by: None,
            scan_count: 0,
        }
    }
}

/// Generate a candidate barcode code: human prefix, base-36 timestamp,
/// 8-character random suffix. Uniqueness is enforced by the store; callers
/// retry on [`CoreError::CodeCollision`].
pub fn generate_code(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "{}{}{}",
        prefix,
        to_base36(millis),
        suffix.to_ascii_uppercase()
    )
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

// ============================================================================
// Scan events
// ============================================================================

/// Immutable audit record of one interaction with a barcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEvent {
    pub id: Uuid,
    pub barcode_id: Uuid,
    pub scan_type: ScanType,
    pub actor_id: String,
    pub actor_role: Role,
    /// Scan location; absent for system events.
    pub op_code: Option<OpCode>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Event payload assembled by the coordinator before the transaction commits.
/// The id is generated (or supplied by the client as a dedup key) up front so
/// credit grants can reference it.
#[derive(Debug, Clone)]
pub struct NewScanEvent {
    pub id: Uuid,
    pub barcode_id: Uuid,
    pub scan_type: ScanType,
    pub actor_id: String,
    pub actor_role: Role,
    pub op_code: Option<OpCode>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewScanEvent {
    pub fn into_event(self, created_at: DateTime<Utc>) -> ScanEvent {
        ScanEvent {
            id: self.id,
            barcode_id: self.barcode_id,
            scan_type: self.scan_type,
            actor_id: self.actor_id,
            actor_role: self.actor_role,
            op_code: self.op_code,
            latitude: self.latitude,
            longitude: self.longitude,
            user_agent: self.user_agent,
            ip: self.ip,
            metadata: self.metadata,
            created_at,
        }
    }
}

/// Pagination window for event history queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
