//! Scan event persistence
//!
//! Events are append-only: inserted inside the transition transaction,
//! never updated. Cleanup deletes by age and only for terminal barcodes.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::barcode::{Page, ScanEvent};
use crate::error::{CoreError, CoreResult};
use crate::opcode::OpCode;
use crate::permission::Role;

const COLUMNS: &str = "id, barcode_id, scan_type, actor_id, actor_role, op_code, latitude, \
     longitude, user_agent, ip, metadata, created_at";

#[derive(Debug, Clone, FromRow)]
pub struct ScanEventRow {
    pub id: Uuid,
    pub barcode_id: Uuid,
    pub scan_type: String,
    pub actor_id: String,
    pub actor_role: String,
    pub op_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ScanEventRow> for ScanEvent {
    type Error = CoreError;

    fn try_from(row: ScanEventRow) -> Result<Self, Self::Error> {
        Ok(ScanEvent {
            id: row.id,
            barcode_id: row.barcode_id,
            scan_type: row.scan_type.parse()?,
            actor_id: row.actor_id,
            actor_role: parse_role(&row.actor_role)?,
            op_code: row.op_code.as_deref().map(OpCode::parse).transpose()?,
            latitude: row.latitude,
            longitude: row.longitude,
            user_agent: row.user_agent,
            ip: row.ip,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

fn parse_role(s: &str) -> CoreResult<Role> {
    match s {
        "user" => Ok(Role::User),
        "courier" => Ok(Role::Courier),
        "admin" => Ok(Role::Admin),
        "platform_admin" => Ok(Role::PlatformAdmin),
        "super_admin" => Ok(Role::SuperAdmin),
        "system" => Ok(Role::System),
        other => Err(CoreError::bad_input(format!("unknown actor role: {other:?}"))),
    }
}

pub async fn insert(tx: &mut Transaction<'_, Postgres>, event: &ScanEvent) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO scan_events (id, barcode_id, scan_type, actor_id, actor_role, op_code, \
         latitude, longitude, user_agent, ip, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(event.id)
    .bind(event.barcode_id)
    .bind(event.scan_type.as_str())
    .bind(&event.actor_id)
    .bind(event.actor_role.as_str())
    .bind(event.op_code.as_ref().map(|c| c.as_str()))
    .bind(event.latitude)
    .bind(event.longitude)
    .bind(&event.user_agent)
    .bind(&event.ip)
    .bind(&event.metadata)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn by_id(pool: &PgPool, id: Uuid) -> CoreResult<Option<ScanEvent>> {
    let row: Option<ScanEventRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM scan_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    row.map(ScanEvent::try_from).transpose()
}

pub async fn history(pool: &PgPool, barcode_id: Uuid, page: Page) -> CoreResult<Vec<ScanEvent>> {
    let rows: Vec<ScanEventRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM scan_events WHERE barcode_id = $1 \
         ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
    ))
    .bind(barcode_id)
    .bind(page.limit as i64)
    .bind(page.offset as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(ScanEvent::try_from).collect()
}

pub async fn timeline(pool: &PgPool, barcode_id: Uuid) -> CoreResult<Vec<ScanEvent>> {
    let rows: Vec<ScanEventRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM scan_events WHERE barcode_id = $1 \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(barcode_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(ScanEvent::try_from).collect()
}

/// Age-based retention cleanup; events of non-terminal barcodes survive
/// regardless of age.
pub async fn prune(pool: &PgPool, older_than: DateTime<Utc>) -> CoreResult<u64> {
    let result = sqlx::query(
        "DELETE FROM scan_events e USING barcodes b \
         WHERE e.barcode_id = b.id \
           AND e.created_at < $1 \
           AND b.status IN ('delivered', 'expired', 'cancelled')",
    )
    .bind(older_than)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
