//! Delivery task persistence
//!
//! The partial unique index on `(barcode_id) WHERE state IN (...)` enforces
//! the one-active-leg invariant at the database level; violations map to
//! `Conflict`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::opcode::OpCode;
use crate::task::{DeliveryTask, TaskState};

const COLUMNS: &str = "id, barcode_id, assigned_courier_id, pickup_op_code, dropoff_op_code, \
     state, deadline, reassign_count, metadata, created_at, completed_at";

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub barcode_id: Uuid,
    pub assigned_courier_id: Option<Uuid>,
    pub pickup_op_code: String,
    pub dropoff_op_code: String,
    pub state: String,
    pub deadline: DateTime<Utc>,
    pub reassign_count: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for DeliveryTask {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(DeliveryTask {
            id: row.id,
            barcode_id: row.barcode_id,
            assigned_courier_id: row.assigned_courier_id,
            pickup_op_code: OpCode::parse(&row.pickup_op_code)?,
            dropoff_op_code: OpCode::parse(&row.dropoff_op_code)?,
            state: row.state.parse()?,
            deadline: row.deadline,
            reassign_count: row.reassign_count,
            metadata: row.metadata,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

pub async fn insert(pool: &PgPool, task: &DeliveryTask) -> CoreResult<()> {
    let result = sqlx::query(
        "INSERT INTO delivery_tasks (id, barcode_id, assigned_courier_id, pickup_op_code, \
         dropoff_op_code, state, deadline, reassign_count, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(task.id)
    .bind(task.barcode_id)
    .bind(task.assigned_courier_id)
    .bind(task.pickup_op_code.as_str())
    .bind(task.dropoff_op_code.as_str())
    .bind(task.state.as_str())
    .bind(task.deadline)
    .bind(task.reassign_count)
    .bind(&task.metadata)
    .bind(task.created_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(CoreError::Conflict(
            format!("barcode {} already has an active task", task.barcode_id),
        )),
        Err(other) => Err(other.into()),
    }
}

pub async fn by_id(pool: &PgPool, id: Uuid) -> CoreResult<Option<DeliveryTask>> {
    let row: Option<TaskRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM delivery_tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    row.map(DeliveryTask::try_from).transpose()
}

pub async fn active_for_barcode(
    pool: &PgPool,
    barcode_id: Uuid,
) -> CoreResult<Option<DeliveryTask>> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM delivery_tasks \
         WHERE barcode_id = $1 AND state IN ('pending', 'accepted', 'in_progress')"
    ))
    .bind(barcode_id)
    .fetch_optional(pool)
    .await?;
    row.map(DeliveryTask::try_from).transpose()
}

pub async fn update(pool: &PgPool, task: &DeliveryTask) -> CoreResult<()> {
    let result = sqlx::query(
        "UPDATE delivery_tasks SET assigned_courier_id = $2, state = $3, deadline = $4, \
         reassign_count = $5, metadata = $6, completed_at = $7 \
         WHERE id = $1",
    )
    .bind(task.id)
    .bind(task.assigned_courier_id)
    .bind(task.state.as_str())
    .bind(task.deadline)
    .bind(task.reassign_count)
    .bind(&task.metadata)
    .bind(task.completed_at)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("task", task.id.to_string()));
    }
    Ok(())
}

pub async fn overdue(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> CoreResult<Vec<DeliveryTask>> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM delivery_tasks \
         WHERE state IN ('pending', 'accepted') AND deadline < $1 \
         ORDER BY created_at LIMIT $2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DeliveryTask::try_from).collect()
}

pub async fn active_count(pool: &PgPool, courier_id: Uuid) -> CoreResult<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM delivery_tasks \
         WHERE assigned_courier_id = $1 AND state IN ('pending', 'accepted', 'in_progress')",
    )
    .bind(courier_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Close the barcode's active leg inside a transition transaction; returns
/// the assigned courier for performance-counter updates.
pub async fn close_active(
    tx: &mut Transaction<'_, Postgres>,
    barcode_id: Uuid,
    state: TaskState,
) -> CoreResult<Option<Option<Uuid>>> {
    let row: Option<(Option<Uuid>,)> = sqlx::query_as(
        "UPDATE delivery_tasks SET state = $2, completed_at = now() \
         WHERE barcode_id = $1 AND state IN ('pending', 'accepted', 'in_progress') \
         RETURNING assigned_courier_id",
    )
    .bind(barcode_id)
    .bind(state.as_str())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(courier,)| courier))
}
