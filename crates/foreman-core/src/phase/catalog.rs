//! Built-in phase catalog, embedded at compile time and seeded into the
//! store at init.

use anyhow::Result;
use serde::Deserialize;
use sqlx::PgPool;

use foreman_db::queries::phases::{self as phase_db, PhaseDef};

/// A phase definition as written in `phases.toml`.
#[derive(Debug, Clone, Deserialize)]
struct PhaseEntry {
    id: String,
    display_name: String,
    sequence_order: i32,
    allowed_transitions: Vec<String>,
    is_terminal: bool,
    requires_review: bool,
    done_definitions: Vec<String>,
    expected_outputs: Vec<String>,
    initial_prompt: String,
    next_steps: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    phases: Vec<PhaseEntry>,
}

/// The embedded phase catalog TOML.
static CATALOG_TOML: &str = include_str!("phases.toml");

/// Load the built-in phase catalog.
///
/// # Panics
///
/// Panics if the embedded TOML is malformed. If the binary was built, the
/// TOML is valid.
pub fn load_catalog() -> Vec<PhaseDef> {
    let file: CatalogFile =
        toml::from_str(CATALOG_TOML).expect("embedded phases.toml is invalid");
    file.phases
        .into_iter()
        .map(|entry| PhaseDef {
            id: entry.id,
            display_name: entry.display_name,
            sequence_order: entry.sequence_order,
            allowed_transitions: entry.allowed_transitions,
            is_terminal: entry.is_terminal,
            requires_review: entry.requires_review,
            done_definitions: entry.done_definitions,
            expected_outputs: entry.expected_outputs,
            initial_prompt: entry.initial_prompt.trim().to_owned(),
            next_steps: entry.next_steps.trim().to_owned(),
        })
        .collect()
}

/// Seed (or refresh) the phase catalog in the store. Idempotent.
pub async fn seed_phases(pool: &PgPool) -> Result<()> {
    for def in load_catalog() {
        phase_db::upsert_phase(pool, &def).await?;
    }
    Ok(())
}
