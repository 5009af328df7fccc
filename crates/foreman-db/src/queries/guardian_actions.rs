//! Database query functions for the `guardian_actions` table. Rows are
//! immutable except for `reverted_at`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{GuardianAction, GuardianActionType};

/// Parameters for recording a guardian intervention.
#[derive(Debug, Clone)]
pub struct NewGuardianAction {
    pub action_type: GuardianActionType,
    pub target_entity_id: Uuid,
    pub authority_level: i32,
    pub reason: String,
    pub initiated_by: String,
    pub approved_by: Option<String>,
    /// Before/after snapshot of the mutated state.
    pub audit_log: Value,
}

/// Insert a guardian action row. Written in the same transaction as the
/// intervention it records.
pub async fn insert_action<'e, E>(exec: E, new: &NewGuardianAction) -> Result<GuardianAction>
where
    E: PgExecutor<'e>,
{
    let action = sqlx::query_as::<_, GuardianAction>(
        "INSERT INTO guardian_actions (action_type, target_entity_id, authority_level, \
                                       reason, initiated_by, approved_by, audit_log) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.action_type)
    .bind(new.target_entity_id)
    .bind(new.authority_level)
    .bind(&new.reason)
    .bind(&new.initiated_by)
    .bind(&new.approved_by)
    .bind(&new.audit_log)
    .fetch_one(exec)
    .await
    .context("failed to insert guardian action")?;

    Ok(action)
}

/// Fetch a single guardian action by ID.
pub async fn get_action<'e, E>(exec: E, id: Uuid) -> Result<Option<GuardianAction>>
where
    E: PgExecutor<'e>,
{
    let action =
        sqlx::query_as::<_, GuardianAction>("SELECT * FROM guardian_actions WHERE id = $1")
            .bind(id)
            .fetch_optional(exec)
            .await
            .context("failed to fetch guardian action")?;

    Ok(action)
}

/// List guardian actions, newest first.
pub async fn list_actions<'e, E>(exec: E, limit: i64) -> Result<Vec<GuardianAction>>
where
    E: PgExecutor<'e>,
{
    let actions = sqlx::query_as::<_, GuardianAction>(
        "SELECT * FROM guardian_actions ORDER BY executed_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(exec)
    .await
    .context("failed to list guardian actions")?;

    Ok(actions)
}

/// Set `reverted_at` on an action that has not yet been reverted.
///
/// Zero rows affected means the action was already reverted (or absent);
/// the caller decides whether that is a no-op or an error.
pub async fn mark_reverted<'e, E>(exec: E, id: Uuid, now: DateTime<Utc>) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE guardian_actions \
         SET reverted_at = $2 \
         WHERE id = $1 AND reverted_at IS NULL",
    )
    .bind(id)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark guardian action reverted")?;

    Ok(result.rows_affected())
}
