//! Barcode persistence
//!
//! Row mapping plus the CAS update at the heart of every lifecycle
//! transition. The unique index on `code` backs global code uniqueness;
//! collisions surface as `CodeCollision` and the caller regenerates.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::barcode::{Barcode, BarcodeStatus};
use crate::error::{CoreError, CoreResult};
use crate::opcode::{OpCode, Recipient};

const COLUMNS: &str = "id, code, letter_ref, status, sender_ref, sender_op_code, recipient, \
     envelope_ref, release_at, created_at, bound_at, delivered_at, last_scanned_at, \
     last_scanned_by, scan_count";

#[derive(Debug, Clone, FromRow)]
pub struct BarcodeRow {
    pub id: Uuid,
    pub code: String,
    pub letter_ref: Option<String>,
    pub status: String,
    pub sender_ref: String,
    pub sender_op_code: Option<String>,
    pub recipient: Option<String>,
    pub envelope_ref: Option<String>,
    pub release_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub bound_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub last_scanned_by: Option<Uuid>,
    pub scan_count: i32,
}

impl TryFrom<BarcodeRow> for Barcode {
    type Error = CoreError;

    fn try_from(row: BarcodeRow) -> Result<Self, Self::Error> {
        Ok(Barcode {
            id: row.id,
            code: row.code,
            letter_ref: row.letter_ref,
            status: row.status.parse()?,
            sender_ref: row.sender_ref,
            sender_op_code: row.sender_op_code.as_deref().map(OpCode::parse).transpose()?,
            recipient: row.recipient.as_deref().map(Recipient::parse).transpose()?,
            envelope_ref: row.envelope_ref,
            release_at: row.release_at,
            created_at: row.created_at,
            bound_at: row.bound_at,
            delivered_at: row.delivered_at,
            last_scanned_at: row.last_scanned_at,
            last_scanned_by: row.last_scanned_by,
            scan_count: row.scan_count,
        })
    }
}

const INSERT_SQL: &str =
    "INSERT INTO barcodes (id, code, letter_ref, status, sender_ref, sender_op_code, \
     recipient, envelope_ref, release_at, created_at, scan_count) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0)";

fn bind_insert(barcode: &Barcode) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT_SQL)
        .bind(barcode.id)
        .bind(&barcode.code)
        .bind(&barcode.letter_ref)
        .bind(barcode.status.as_str())
        .bind(&barcode.sender_ref)
        .bind(barcode.sender_op_code.as_ref().map(|c| c.as_str()))
        .bind(barcode.recipient.as_ref().map(|r| r.as_str()))
        .bind(&barcode.envelope_ref)
        .bind(barcode.release_at)
        .bind(barcode.created_at)
}

fn map_insert_error(err: sqlx::Error, barcode: &Barcode) -> CoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::CodeCollision {
            code: barcode.code.clone(),
        },
        other => other.into(),
    }
}

pub async fn insert(pool: &PgPool, barcode: &Barcode) -> CoreResult<()> {
    bind_insert(barcode)
        .execute(pool)
        .await
        .map_err(|e| map_insert_error(e, barcode))?;
    Ok(())
}

/// Batch insert inside one open transaction; the first duplicate code
/// aborts the whole batch (the caller rolls back by dropping the tx).
pub async fn insert_many(
    tx: &mut Transaction<'_, Postgres>,
    barcodes: &[Barcode],
) -> CoreResult<()> {
    for barcode in barcodes {
        bind_insert(barcode)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error(e, barcode))?;
    }
    Ok(())
}

pub async fn by_id(pool: &PgPool, id: Uuid) -> CoreResult<Option<Barcode>> {
    let row: Option<BarcodeRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM barcodes WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    row.map(Barcode::try_from).transpose()
}

pub async fn by_code(pool: &PgPool, code: &str) -> CoreResult<Option<Barcode>> {
    let row: Option<BarcodeRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM barcodes WHERE code = $1"))
            .bind(code)
            .fetch_optional(pool)
            .await?;
    row.map(Barcode::try_from).transpose()
}

pub async fn release_due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> CoreResult<Vec<Barcode>> {
    let rows: Vec<BarcodeRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM barcodes \
         WHERE status = 'unactivated' AND release_at IS NOT NULL AND release_at <= $1 \
         ORDER BY release_at LIMIT $2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Barcode::try_from).collect()
}

pub async fn stale_unbound(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> CoreResult<Vec<Barcode>> {
    let rows: Vec<BarcodeRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM barcodes \
         WHERE status = 'unactivated' AND release_at IS NULL AND created_at < $1 \
         ORDER BY created_at LIMIT $2"
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Barcode::try_from).collect()
}

pub async fn drift_bound_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> CoreResult<Vec<Barcode>> {
    let rows: Vec<BarcodeRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM barcodes \
         WHERE status = 'bound' AND recipient = 'PUBLIC' AND bound_at < $1 \
         ORDER BY bound_at LIMIT $2"
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Barcode::try_from).collect()
}

/// Compare-and-swap transition inside an open transaction. Returns the
/// updated barcode, or `None` when the status no longer matched (the caller
/// reads the current status and retries or reports).
#[allow(clippy::too_many_arguments)]
pub async fn cas_transition(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    expected: BarcodeStatus,
    new_status: BarcodeStatus,
    set_recipient: Option<&str>,
    set_envelope: Option<&str>,
    physical_scan: bool,
    scanned_by: Option<Uuid>,
) -> CoreResult<Option<Barcode>> {
    let row: Option<BarcodeRow> = sqlx::query_as(&format!(
        "UPDATE barcodes SET \
            status = $3, \
            recipient = COALESCE($4, recipient), \
            envelope_ref = COALESCE($5, envelope_ref), \
            bound_at = CASE WHEN $3 = 'bound' AND bound_at IS NULL THEN now() ELSE bound_at END, \
            delivered_at = CASE WHEN $3 = 'delivered' THEN now() ELSE delivered_at END, \
            last_scanned_at = CASE WHEN $6 THEN now() ELSE last_scanned_at END, \
            last_scanned_by = CASE WHEN $6 THEN $7 ELSE last_scanned_by END, \
            scan_count = scan_count + CASE WHEN $6 THEN 1 ELSE 0 END \
         WHERE id = $1 AND status = $2 \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(expected.as_str())
    .bind(new_status.as_str())
    .bind(set_recipient)
    .bind(set_envelope)
    .bind(physical_scan)
    .bind(scanned_by)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(Barcode::try_from).transpose()
}

/// Current status inside the transaction, for CAS-miss reporting.
pub async fn status_of(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> CoreResult<Option<BarcodeStatus>> {
    let status: Option<(String,)> = sqlx::query_as("SELECT status FROM barcodes WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    status.map(|(s,)| s.parse()).transpose()
}
