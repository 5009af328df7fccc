//! Database query functions for the `tickets` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Priority, Ticket, TicketStatus};

/// Parameters for inserting a new ticket row.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub phase_id: Option<String>,
}

/// Insert a new ticket row with status `pending`.
pub async fn insert_ticket<'e, E>(exec: E, new: &NewTicket) -> Result<Ticket>
where
    E: PgExecutor<'e>,
{
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (title, description, priority, phase_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.priority)
    .bind(&new.phase_id)
    .fetch_one(exec)
    .await
    .context("failed to insert ticket")?;

    Ok(ticket)
}

/// Fetch a single ticket by ID.
pub async fn get_ticket<'e, E>(exec: E, id: Uuid) -> Result<Option<Ticket>>
where
    E: PgExecutor<'e>,
{
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// Fetch a single ticket by ID with a row lock (`FOR UPDATE`).
pub async fn get_ticket_for_update<'e, E>(exec: E, id: Uuid) -> Result<Option<Ticket>>
where
    E: PgExecutor<'e>,
{
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch ticket for update")?;

    Ok(ticket)
}

/// List all tickets, newest first.
pub async fn list_tickets<'e, E>(exec: E) -> Result<Vec<Ticket>>
where
    E: PgExecutor<'e>,
{
    let tickets = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets ORDER BY created_at DESC")
        .fetch_all(exec)
        .await
        .context("failed to list tickets")?;

    Ok(tickets)
}

/// List tickets that are not in a terminal status.
pub async fn list_open_tickets<'e, E>(exec: E) -> Result<Vec<Ticket>>
where
    E: PgExecutor<'e>,
{
    let tickets = sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets \
         WHERE status IN ('pending', 'in_progress', 'blocked') \
         ORDER BY created_at ASC",
    )
    .fetch_all(exec)
    .await
    .context("failed to list open tickets")?;

    Ok(tickets)
}

/// Atomically transition a ticket from one status to another.
pub async fn transition_status<'e, E>(
    exec: E,
    id: Uuid,
    from: TicketStatus,
    to: TicketStatus,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tickets \
         SET status = $3, updated_at = $4, version = version + 1 \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to transition ticket status")?;

    Ok(result.rows_affected())
}

/// Move a ticket onto a phase, optionally updating its status in the same
/// statement. Guarded by the expected row version.
pub async fn set_phase<'e, E>(
    exec: E,
    id: Uuid,
    phase_id: &str,
    status: Option<TicketStatus>,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tickets \
         SET phase_id = $2, \
             status = COALESCE($3, status), \
             updated_at = $5, \
             version = version + 1 \
         WHERE id = $1 AND version = $4",
    )
    .bind(id)
    .bind(phase_id)
    .bind(status)
    .bind(expected_version)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to set ticket phase")?;

    Ok(result.rows_affected())
}
