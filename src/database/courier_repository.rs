//! Courier tree persistence

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::courier::{Courier, CourierLevel, CourierStatus};
use crate::error::{CoreError, CoreResult};
use crate::opcode::{OpCode, OpCodePrefix};

const COLUMNS: &str = "id, user_ref, level, managed_prefix, parent_id, status, \
     needs_reassignment, completed, successful, rating, created_at";

#[derive(Debug, Clone, FromRow)]
pub struct CourierRow {
    pub id: Uuid,
    pub user_ref: String,
    pub level: i16,
    pub managed_prefix: String,
    pub parent_id: Option<Uuid>,
    pub status: String,
    pub needs_reassignment: bool,
    pub completed: i32,
    pub successful: i32,
    pub rating: f64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CourierRow> for Courier {
    type Error = CoreError;

    fn try_from(row: CourierRow) -> Result<Self, Self::Error> {
        Ok(Courier {
            id: row.id,
            user_ref: row.user_ref,
            level: CourierLevel::from_u8(row.level as u8)?,
            managed_prefix: OpCodePrefix::parse(&row.managed_prefix)?,
            parent_id: row.parent_id,
            status: row.status.parse::<CourierStatus>()?,
            needs_reassignment: row.needs_reassignment,
            completed: row.completed,
            successful: row.successful,
            rating: row.rating,
            created_at: row.created_at,
        })
    }
}

pub async fn insert(pool: &PgPool, courier: &Courier) -> CoreResult<()> {
    let result = sqlx::query(
        "INSERT INTO couriers (id, user_ref, level, managed_prefix, parent_id, status, \
         needs_reassignment, completed, successful, rating, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(courier.id)
    .bind(&courier.user_ref)
    .bind(courier.level.as_u8() as i16)
    .bind(courier.managed_prefix.as_str())
    .bind(courier.parent_id)
    .bind(courier.status.as_str())
    .bind(courier.needs_reassignment)
    .bind(courier.completed)
    .bind(courier.successful)
    .bind(courier.rating)
    .bind(courier.created_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(CoreError::Conflict(
            format!("city root for {} already exists", courier.managed_prefix),
        )),
        Err(other) => Err(other.into()),
    }
}

pub async fn by_id(pool: &PgPool, id: Uuid) -> CoreResult<Option<Courier>> {
    let row: Option<CourierRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM couriers WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    row.map(Courier::try_from).transpose()
}

pub async fn by_user(pool: &PgPool, user_ref: &str) -> CoreResult<Option<Courier>> {
    let row: Option<CourierRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM couriers \
         WHERE user_ref = $1 AND status <> 'resigned' \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(user_ref)
    .fetch_optional(pool)
    .await?;
    row.map(Courier::try_from).transpose()
}

pub async fn update(pool: &PgPool, courier: &Courier) -> CoreResult<()> {
    let result = sqlx::query(
        "UPDATE couriers SET user_ref = $2, level = $3, managed_prefix = $4, parent_id = $5, \
         status = $6, needs_reassignment = $7, completed = $8, successful = $9, rating = $10 \
         WHERE id = $1",
    )
    .bind(courier.id)
    .bind(&courier.user_ref)
    .bind(courier.level.as_u8() as i16)
    .bind(courier.managed_prefix.as_str())
    .bind(courier.parent_id)
    .bind(courier.status.as_str())
    .bind(courier.needs_reassignment)
    .bind(courier.completed)
    .bind(courier.successful)
    .bind(courier.rating)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("courier", courier.id.to_string()));
    }
    Ok(())
}

pub async fn children_of(pool: &PgPool, parent_id: Uuid) -> CoreResult<Vec<Courier>> {
    let rows: Vec<CourierRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM couriers \
         WHERE parent_id = $1 AND status <> 'resigned' ORDER BY created_at"
    ))
    .bind(parent_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Courier::try_from).collect()
}

pub async fn city_root(pool: &PgPool, school_prefix: &str) -> CoreResult<Option<Courier>> {
    let row: Option<CourierRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM couriers \
         WHERE level = 4 AND status <> 'resigned' AND managed_prefix = $1"
    ))
    .bind(school_prefix)
    .fetch_optional(pool)
    .await?;
    row.map(Courier::try_from).transpose()
}

/// Active couriers whose prefix contains the target code.
pub async fn covering(pool: &PgPool, target: &OpCode) -> CoreResult<Vec<Courier>> {
    let rows: Vec<CourierRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM couriers \
         WHERE status = 'active' AND $1 LIKE managed_prefix || '%' \
         ORDER BY created_at"
    ))
    .bind(target.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Courier::try_from).collect()
}

/// Bump performance counters inside a transition transaction.
pub async fn bump_counters(
    tx: &mut Transaction<'_, Postgres>,
    courier_id: Uuid,
    successful: bool,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE couriers SET completed = completed + 1, \
         successful = successful + CASE WHEN $2 THEN 1 ELSE 0 END \
         WHERE id = $1",
    )
    .bind(courier_id)
    .bind(successful)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
