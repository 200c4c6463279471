//! Credit ledger persistence
//!
//! The unique index on `(user_ref, kind, source_event_id)` is the entire
//! idempotency mechanism. Cap arbitration locks the counter row
//! (`FOR UPDATE`) so concurrent grants at the cap cannot both pass.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::credit::{CreditEventKind, CreditGrant, GrantOutcome, PendingGrant};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, FromRow)]
pub struct GrantRow {
    pub id: Uuid,
    pub user_ref: String,
    pub kind: String,
    pub points: i64,
    pub source_event_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for CreditGrant {
    type Error = CoreError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        Ok(CreditGrant {
            id: row.id,
            user_ref: row.user_ref,
            kind: row.kind.parse()?,
            points: row.points,
            source_event_id: row.source_event_id,
            created_at: row.created_at,
        })
    }
}

/// Full grant protocol inside an open transaction: idempotency, caps,
/// insert, counters, balance.
pub async fn apply_grant(
    tx: &mut Transaction<'_, Postgres>,
    pending: &PendingGrant,
    source_event_id: Uuid,
) -> CoreResult<GrantOutcome> {
    let existing: Option<GrantRow> = sqlx::query_as(
        "SELECT id, user_ref, kind, points, source_event_id, created_at \
         FROM credit_grants \
         WHERE user_ref = $1 AND kind = $2 AND source_event_id = $3",
    )
    .bind(&pending.user_ref)
    .bind(pending.kind.as_str())
    .bind(source_event_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = existing {
        return Ok(GrantOutcome::Existing(row.try_into()?));
    }

    // Materialise and lock the counter row before the cap check.
    sqlx::query(
        "INSERT INTO credit_counters (user_ref, kind) VALUES ($1, $2) \
         ON CONFLICT (user_ref, kind) DO NOTHING",
    )
    .bind(&pending.user_ref)
    .bind(pending.kind.as_str())
    .execute(&mut **tx)
    .await?;
    let (daily, weekly): (i32, i32) = sqlx::query_as(
        "SELECT daily_count, weekly_count FROM credit_counters \
         WHERE user_ref = $1 AND kind = $2 FOR UPDATE",
    )
    .bind(&pending.user_ref)
    .bind(pending.kind.as_str())
    .fetch_one(&mut **tx)
    .await?;

    if pending
        .daily_limit
        .is_some_and(|limit| daily as u32 >= limit)
        || pending
            .weekly_limit
            .is_some_and(|limit| weekly as u32 >= limit)
    {
        return Ok(GrantOutcome::CapReached);
    }

    let grant = CreditGrant {
        id: Uuid::new_v4(),
        user_ref: pending.user_ref.clone(),
        kind: pending.kind,
        points: pending.points,
        source_event_id,
        created_at: Utc::now(),
    };
    let inserted = sqlx::query(
        "INSERT INTO credit_grants (id, user_ref, kind, points, source_event_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (user_ref, kind, source_event_id) DO NOTHING",
    )
    .bind(grant.id)
    .bind(&grant.user_ref)
    .bind(grant.kind.as_str())
    .bind(grant.points)
    .bind(grant.source_event_id)
    .bind(grant.created_at)
    .execute(&mut **tx)
    .await?;
    if inserted.rows_affected() == 0 {
        // Raced with another transaction on the same event id.
        let row: GrantRow = sqlx::query_as(
            "SELECT id, user_ref, kind, points, source_event_id, created_at \
             FROM credit_grants \
             WHERE user_ref = $1 AND kind = $2 AND source_event_id = $3",
        )
        .bind(&grant.user_ref)
        .bind(grant.kind.as_str())
        .bind(source_event_id)
        .fetch_one(&mut **tx)
        .await?;
        return Ok(GrantOutcome::Existing(row.try_into()?));
    }

    sqlx::query(
        "UPDATE credit_counters SET daily_count = daily_count + 1, \
         weekly_count = weekly_count + 1, updated_at = now() \
         WHERE user_ref = $1 AND kind = $2",
    )
    .bind(&grant.user_ref)
    .bind(grant.kind.as_str())
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO credit_balances (user_ref, points) VALUES ($1, $2) \
         ON CONFLICT (user_ref) DO UPDATE \
         SET points = credit_balances.points + EXCLUDED.points, updated_at = now()",
    )
    .bind(&grant.user_ref)
    .bind(grant.points)
    .execute(&mut **tx)
    .await?;

    Ok(GrantOutcome::Granted(grant))
}

pub async fn balance(pool: &PgPool, user_ref: &str) -> CoreResult<i64> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT points FROM credit_balances WHERE user_ref = $1")
            .bind(user_ref)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(points,)| points).unwrap_or(0))
}

pub async fn counters(
    pool: &PgPool,
    user_ref: &str,
    kind: CreditEventKind,
) -> CoreResult<(u32, u32)> {
    let row: Option<(i32, i32)> = sqlx::query_as(
        "SELECT daily_count, weekly_count FROM credit_counters \
         WHERE user_ref = $1 AND kind = $2",
    )
    .bind(user_ref)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row
        .map(|(d, w)| (d as u32, w as u32))
        .unwrap_or((0, 0)))
}

pub async fn reset_daily(pool: &PgPool) -> CoreResult<()> {
    sqlx::query("UPDATE credit_counters SET daily_count = 0, updated_at = now()")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn reset_weekly(pool: &PgPool) -> CoreResult<()> {
    sqlx::query("UPDATE credit_counters SET weekly_count = 0, updated_at = now()")
        .execute(pool)
        .await?;
    Ok(())
}
