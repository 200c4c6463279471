//! Scheduled task persistence

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::error::CoreResult;
use crate::scheduler::ScheduledTask;

const COLUMNS: &str =
    "id, cron_expr, delay_until, handler_key, payload, enabled, last_fired, next_fire, \
     failure_count";

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub id: String,
    pub cron_expr: Option<String>,
    pub delay_until: Option<DateTime<Utc>>,
    pub handler_key: String,
    pub payload: serde_json::Value,
    pub enabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub failure_count: i32,
}

impl From<ScheduleRow> for ScheduledTask {
    fn from(row: ScheduleRow) -> Self {
        ScheduledTask {
            id: row.id,
            cron_expr: row.cron_expr,
            delay_until: row.delay_until,
            handler_key: row.handler_key,
            payload: row.payload,
            enabled: row.enabled,
            last_fired: row.last_fired,
            next_fire: row.next_fire,
            failure_count: row.failure_count.max(0) as u32,
        }
    }
}

pub async fn upsert(pool: &PgPool, task: &ScheduledTask) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO scheduled_tasks (id, cron_expr, delay_until, handler_key, payload, \
         enabled, last_fired, next_fire, failure_count) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (id) DO UPDATE SET \
            cron_expr = EXCLUDED.cron_expr, \
            delay_until = EXCLUDED.delay_until, \
            handler_key = EXCLUDED.handler_key, \
            payload = EXCLUDED.payload, \
            enabled = EXCLUDED.enabled, \
            last_fired = EXCLUDED.last_fired, \
            next_fire = EXCLUDED.next_fire, \
            failure_count = EXCLUDED.failure_count",
    )
    .bind(&task.id)
    .bind(&task.cron_expr)
    .bind(task.delay_until)
    .bind(&task.handler_key)
    .bind(&task.payload)
    .bind(task.enabled)
    .bind(task.last_fired)
    .bind(task.next_fire)
    .bind(task.failure_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn by_id(pool: &PgPool, id: &str) -> CoreResult<Option<ScheduledTask>> {
    let row: Option<ScheduleRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM scheduled_tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(ScheduledTask::from))
}

pub async fn list(pool: &PgPool) -> CoreResult<Vec<ScheduledTask>> {
    let rows: Vec<ScheduleRow> =
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM scheduled_tasks ORDER BY id"))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(ScheduledTask::from).collect())
}
