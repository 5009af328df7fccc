//! `foreman log`: page through the durable event table for an entity.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_db::queries::events as event_db;

const KNOWN_ENTITY_TYPES: &[&str] = &["ticket", "task", "agent", "guardian_action", "discovery"];

pub async fn run_log(
    engine: &Engine,
    entity_type: &str,
    entity_id_str: &str,
    limit: i64,
) -> Result<()> {
    if !KNOWN_ENTITY_TYPES.contains(&entity_type) {
        bail!(
            "unknown entity type {entity_type:?} (expected one of: {})",
            KNOWN_ENTITY_TYPES.join(", ")
        );
    }
    let entity_id = Uuid::parse_str(entity_id_str)
        .with_context(|| format!("invalid entity ID: {entity_id_str}"))?;

    let events = event_db::list_for_entity(&engine.pool, entity_type, entity_id, limit).await?;
    if events.is_empty() {
        println!("No events for {entity_type} {entity_id}.");
        return Ok(());
    }

    for event in &events {
        println!(
            "{}  {:<36} {}",
            event.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            event.event_type,
            serde_json::to_string(&event.payload).unwrap_or_default(),
        );
    }
    Ok(())
}
