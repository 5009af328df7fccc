//! Database query functions for the append-only `events` table.
//!
//! The durable subset of the event taxonomy is written here in the same
//! transaction as the mutation that produced it, so the audit trail can be
//! reconstructed from the store alone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::EventRow;

/// Parameters for appending an event row. `recorded_at` comes from the
/// engine's clock, not the database's, so sweeps that reason about event
/// age see the same timeline as the rest of the engine.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append an event row. Returns the inserted row.
pub async fn insert_event<'e, E>(exec: E, new: &NewEvent) -> Result<EventRow>
where
    E: PgExecutor<'e>,
{
    let event = sqlx::query_as::<_, EventRow>(
        "INSERT INTO events (event_type, entity_type, entity_id, payload, recorded_at) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.event_type)
    .bind(&new.entity_type)
    .bind(new.entity_id)
    .bind(&new.payload)
    .bind(new.recorded_at)
    .fetch_one(exec)
    .await
    .with_context(|| {
        format!(
            "failed to insert event {} for {} {}",
            new.event_type, new.entity_type, new.entity_id
        )
    })?;

    Ok(event)
}

/// List events for an entity, oldest first.
pub async fn list_for_entity<'e, E>(
    exec: E,
    entity_type: &str,
    entity_id: Uuid,
    limit: i64,
) -> Result<Vec<EventRow>>
where
    E: PgExecutor<'e>,
{
    let events = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events \
         WHERE entity_type = $1 AND entity_id = $2 \
         ORDER BY recorded_at ASC, id ASC \
         LIMIT $3",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(limit)
    .fetch_all(exec)
    .await
    .with_context(|| format!("failed to list events for {entity_type} {entity_id}"))?;

    Ok(events)
}

/// The most recent event of a given type for an entity, if any.
pub async fn latest_of_type<'e, E>(
    exec: E,
    event_type: &str,
    entity_id: Uuid,
) -> Result<Option<EventRow>>
where
    E: PgExecutor<'e>,
{
    let event = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM events \
         WHERE event_type = $1 AND entity_id = $2 \
         ORDER BY recorded_at DESC, id DESC \
         LIMIT 1",
    )
    .bind(event_type)
    .bind(entity_id)
    .fetch_optional(exec)
    .await
    .with_context(|| format!("failed to fetch latest {event_type} event for {entity_id}"))?;

    Ok(event)
}

/// Whether any event of the given type exists for the entity.
pub async fn has_event_of_type<'e, E>(exec: E, event_type: &str, entity_id: Uuid) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM events WHERE event_type = $1 AND entity_id = $2)",
    )
    .bind(event_type)
    .bind(entity_id)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to check for {event_type} event on {entity_id}"))?;

    Ok(exists)
}

