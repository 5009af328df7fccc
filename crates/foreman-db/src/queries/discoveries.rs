//! Database query functions for the `discoveries` table. Rows are
//! immutable once written.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Discovery, DiscoveryType};

/// Parameters for inserting a discovery row.
#[derive(Debug, Clone)]
pub struct NewDiscovery {
    pub source_task_id: Uuid,
    pub discovery_type: DiscoveryType,
    pub description: String,
    pub spawn_phase_id: String,
    pub spawn_task_id: Uuid,
    pub priority_boost: bool,
}

/// Insert a discovery row. Returns the inserted row.
pub async fn insert_discovery<'e, E>(exec: E, new: &NewDiscovery) -> Result<Discovery>
where
    E: PgExecutor<'e>,
{
    let discovery = sqlx::query_as::<_, Discovery>(
        "INSERT INTO discoveries (source_task_id, discovery_type, description, \
                                  spawn_phase_id, spawn_task_id, priority_boost) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.source_task_id)
    .bind(new.discovery_type)
    .bind(&new.description)
    .bind(&new.spawn_phase_id)
    .bind(new.spawn_task_id)
    .bind(new.priority_boost)
    .fetch_one(exec)
    .await
    .context("failed to insert discovery")?;

    Ok(discovery)
}

/// List discoveries reported from a given source task, oldest first.
pub async fn list_for_source_task<'e, E>(exec: E, source_task_id: Uuid) -> Result<Vec<Discovery>>
where
    E: PgExecutor<'e>,
{
    let discoveries = sqlx::query_as::<_, Discovery>(
        "SELECT * FROM discoveries \
         WHERE source_task_id = $1 \
         ORDER BY created_at ASC",
    )
    .bind(source_task_id)
    .fetch_all(exec)
    .await
    .context("failed to list discoveries for source task")?;

    Ok(discoveries)
}
