//! Database query functions for the `phases` table.
//!
//! Phases are configuration data: the catalog is seeded from the embedded
//! definitions at init time and read thereafter.

use anyhow::{Context, Result};
use sqlx::PgExecutor;

use crate::models::Phase;

/// Parameters for seeding a phase definition.
#[derive(Debug, Clone)]
pub struct PhaseDef {
    pub id: String,
    pub display_name: String,
    pub sequence_order: i32,
    pub allowed_transitions: Vec<String>,
    pub is_terminal: bool,
    pub requires_review: bool,
    pub done_definitions: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub initial_prompt: String,
    pub next_steps: String,
}

/// Insert or update a phase definition. Idempotent on the phase id.
pub async fn upsert_phase<'e, E>(exec: E, def: &PhaseDef) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO phases (id, display_name, sequence_order, allowed_transitions, \
                             is_terminal, requires_review, done_definitions, \
                             expected_outputs, initial_prompt, next_steps) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (id) DO UPDATE SET \
             display_name = EXCLUDED.display_name, \
             sequence_order = EXCLUDED.sequence_order, \
             allowed_transitions = EXCLUDED.allowed_transitions, \
             is_terminal = EXCLUDED.is_terminal, \
             requires_review = EXCLUDED.requires_review, \
             done_definitions = EXCLUDED.done_definitions, \
             expected_outputs = EXCLUDED.expected_outputs, \
             initial_prompt = EXCLUDED.initial_prompt, \
             next_steps = EXCLUDED.next_steps",
    )
    .bind(&def.id)
    .bind(&def.display_name)
    .bind(def.sequence_order)
    .bind(&def.allowed_transitions)
    .bind(def.is_terminal)
    .bind(def.requires_review)
    .bind(&def.done_definitions)
    .bind(&def.expected_outputs)
    .bind(&def.initial_prompt)
    .bind(&def.next_steps)
    .execute(exec)
    .await
    .with_context(|| format!("failed to upsert phase {}", def.id))?;

    Ok(())
}

/// Fetch a single phase by id.
pub async fn get_phase<'e, E>(exec: E, id: &str) -> Result<Option<Phase>>
where
    E: PgExecutor<'e>,
{
    let phase = sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch phase")?;

    Ok(phase)
}

/// List the full phase catalog in workflow order.
pub async fn list_phases<'e, E>(exec: E) -> Result<Vec<Phase>>
where
    E: PgExecutor<'e>,
{
    let phases =
        sqlx::query_as::<_, Phase>("SELECT * FROM phases ORDER BY sequence_order ASC")
            .fetch_all(exec)
            .await
            .context("failed to list phases")?;

    Ok(phases)
}

/// The workflow's entry phase: lowest `sequence_order` among non-terminal
/// phases.
pub async fn initial_phase<'e, E>(exec: E) -> Result<Option<Phase>>
where
    E: PgExecutor<'e>,
{
    let phase = sqlx::query_as::<_, Phase>(
        "SELECT * FROM phases \
         WHERE is_terminal = FALSE \
         ORDER BY sequence_order ASC \
         LIMIT 1",
    )
    .fetch_optional(exec)
    .await
    .context("failed to fetch initial phase")?;

    Ok(phase)
}
