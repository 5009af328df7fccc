//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Agent, AgentStatus, AgentType};

/// Parameters for inserting a new agent row.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub agent_type: AgentType,
    pub phase_id: Option<String>,
    pub capabilities: Vec<String>,
    pub capacity: i32,
    pub authority_level: i32,
}

/// Insert a new agent row with status `idle` and zero load.
pub async fn insert_agent<'e, E>(exec: E, new: &NewAgent) -> Result<Agent>
where
    E: PgExecutor<'e>,
{
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (agent_type, phase_id, capabilities, capacity, authority_level) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.agent_type)
    .bind(&new.phase_id)
    .bind(&new.capabilities)
    .bind(new.capacity)
    .bind(new.authority_level)
    .fetch_one(exec)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent<'e, E>(exec: E, id: Uuid) -> Result<Option<Agent>>
where
    E: PgExecutor<'e>,
{
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID with a row lock (`FOR UPDATE`).
pub async fn get_agent_for_update<'e, E>(exec: E, id: Uuid) -> Result<Option<Agent>>
where
    E: PgExecutor<'e>,
{
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch agent for update")?;

    Ok(agent)
}

/// List all agents, newest first.
pub async fn list_agents<'e, E>(exec: E) -> Result<Vec<Agent>>
where
    E: PgExecutor<'e>,
{
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents ORDER BY created_at DESC")
        .fetch_all(exec)
        .await
        .context("failed to list agents")?;

    Ok(agents)
}

/// List agents that may receive new work: schedulable status and spare
/// capacity.
pub async fn list_available<'e, E>(exec: E) -> Result<Vec<Agent>>
where
    E: PgExecutor<'e>,
{
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE status IN ('idle', 'busy') AND current_load < capacity \
         ORDER BY current_load ASC, last_heartbeat DESC, id ASC",
    )
    .fetch_all(exec)
    .await
    .context("failed to list available agents")?;

    Ok(agents)
}

/// Find agents eligible for a phase and capability set.
///
/// An agent matches when its phase scope covers `phase_id` (a NULL scope
/// covers every phase), its capabilities are a superset of `required`, it is
/// schedulable, and it has spare capacity. Ordered by load ascending, then
/// most recent heartbeat, then id.
pub async fn find_eligible<'e, E>(
    exec: E,
    phase_id: &str,
    required: &[String],
) -> Result<Vec<Agent>>
where
    E: PgExecutor<'e>,
{
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE (phase_id IS NULL OR phase_id = $1) \
           AND capabilities @> $2 \
           AND status IN ('idle', 'busy') \
           AND current_load < capacity \
         ORDER BY current_load ASC, last_heartbeat DESC, id ASC",
    )
    .bind(phase_id)
    .bind(required)
    .fetch_all(exec)
    .await
    .context("failed to find eligible agents")?;

    Ok(agents)
}

/// Update an agent's heartbeat timestamp, optionally overriding its status.
pub async fn update_heartbeat<'e, E>(
    exec: E,
    id: Uuid,
    now: DateTime<Utc>,
    status: Option<AgentStatus>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE agents \
         SET last_heartbeat = $2, \
             status = COALESCE($3, status), \
             version = version + 1 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(now)
    .bind(status)
    .execute(exec)
    .await
    .context("failed to update agent heartbeat")?;

    Ok(result.rows_affected())
}

/// Adjust an agent's load by `delta`, flipping idle/busy to track the new
/// load. Degraded and terminated agents keep their status. The WHERE clause
/// keeps the load within `[0, capacity]`; zero rows affected means the
/// adjustment would have violated that band.
pub async fn adjust_load<'e, E>(exec: E, id: Uuid, delta: i32) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE agents \
         SET current_load = current_load + $2, \
             status = CASE \
                        WHEN status IN ('idle', 'busy') THEN \
                          CASE WHEN current_load + $2 > 0 THEN 'busy' ELSE 'idle' END \
                        ELSE status \
                      END, \
             version = version + 1 \
         WHERE id = $1 \
           AND current_load + $2 >= 0 \
           AND current_load + $2 <= capacity",
    )
    .bind(id)
    .bind(delta)
    .execute(exec)
    .await
    .context("failed to adjust agent load")?;

    Ok(result.rows_affected())
}

/// Release one unit of load without the capacity upper-bound check.
///
/// Used on paths that free work from an agent whose capacity may have been
/// reduced by a guardian reallocation after the work was assigned.
pub async fn release_load<'e, E>(exec: E, id: Uuid) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE agents \
         SET current_load = current_load - 1, \
             status = CASE \
                        WHEN status IN ('idle', 'busy') THEN \
                          CASE WHEN current_load - 1 > 0 THEN 'busy' ELSE 'idle' END \
                        ELSE status \
                      END, \
             version = version + 1 \
         WHERE id = $1 AND current_load > 0",
    )
    .bind(id)
    .execute(exec)
    .await
    .context("failed to release agent load")?;

    Ok(result.rows_affected())
}

/// Mark every schedulable agent whose heartbeat predates `cutoff` as
/// `degraded`, returning the affected rows. The comparison is strict: an
/// agent whose heartbeat equals the cutoff exactly is not stale.
pub async fn mark_stale<'e, E>(exec: E, cutoff: DateTime<Utc>) -> Result<Vec<Agent>>
where
    E: PgExecutor<'e>,
{
    let agents = sqlx::query_as::<_, Agent>(
        "UPDATE agents \
         SET status = 'degraded', version = version + 1 \
         WHERE last_heartbeat < $1 AND status IN ('idle', 'busy') \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(exec)
    .await
    .context("failed to mark stale agents")?;

    Ok(agents)
}

/// Overwrite an agent's capacity, guarded by the expected row version.
pub async fn update_capacity<'e, E>(
    exec: E,
    id: Uuid,
    capacity: i32,
    expected_version: i64,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE agents \
         SET capacity = $2, version = version + 1 \
         WHERE id = $1 AND version = $3",
    )
    .bind(id)
    .bind(capacity)
    .bind(expected_version)
    .execute(exec)
    .await
    .context("failed to update agent capacity")?;

    Ok(result.rows_affected())
}

/// Set an agent's status directly (e.g. `terminated`).
pub async fn set_status<'e, E>(exec: E, id: Uuid, status: AgentStatus) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE agents SET status = $2, version = version + 1 WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .execute(exec)
    .await
    .context("failed to set agent status")?;

    Ok(result.rows_affected())
}
