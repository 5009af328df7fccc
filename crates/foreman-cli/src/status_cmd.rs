//! `foreman status` command: ticket progress and fleet overview.

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_db::queries::{tasks as task_db, tickets as ticket_db};

use crate::ticket_cmds::status_icon;

/// Run the status command.
///
/// When `ticket_id_str` is `Some`, shows detailed status for that ticket.
/// When `None`, lists all tickets with a progress summary.
pub async fn run_status(engine: &Engine, ticket_id_str: Option<&str>) -> Result<()> {
    match ticket_id_str {
        Some(id_str) => run_ticket_status(engine, id_str).await,
        None => run_fleet_status(engine).await,
    }
}

async fn run_ticket_status(engine: &Engine, ticket_id_str: &str) -> Result<()> {
    let ticket_id = Uuid::parse_str(ticket_id_str)
        .with_context(|| format!("invalid ticket ID: {ticket_id_str}"))?;

    let ticket = engine.phases.get_ticket(ticket_id).await?;

    println!("Ticket: {} ({})", ticket.title, ticket.id);
    println!("Status: {}", ticket.status);
    println!("Priority: {}", ticket.priority);
    match &ticket.phase_id {
        Some(phase) => println!("Phase: {phase}"),
        None => println!("Phase: (not started)"),
    }
    println!();

    let progress = task_db::get_ticket_progress(&engine.pool, ticket_id).await?;
    println!("Progress: {}/{} completed", progress.completed, progress.total);
    println!(
        "  pending={} blocked={} assigned={} running={} under_review={} completed={} failed={} cancelled={} timed_out={}",
        progress.pending,
        progress.blocked,
        progress.assigned,
        progress.running,
        progress.under_review,
        progress.completed,
        progress.failed,
        progress.cancelled,
        progress.timed_out,
    );
    println!();

    let tasks = task_db::list_tasks_for_ticket(&engine.pool, ticket_id).await?;
    println!("Tasks:");
    for task in &tasks {
        println!(
            "  [{}] {} {} ({}, retry {}/{})",
            status_icon(&task.status.to_string()),
            task.id,
            task.phase_id,
            task.status,
            task.retry_count,
            task.max_retries,
        );
    }

    Ok(())
}

async fn run_fleet_status(engine: &Engine) -> Result<()> {
    let tickets = ticket_db::list_tickets(&engine.pool).await?;

    if tickets.is_empty() {
        println!("No tickets found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<12} {:<20} {:>10}",
        "ID", "TITLE", "STATUS", "PHASE", "PROGRESS"
    );
    println!("{}", "-".repeat(114));

    for ticket in &tickets {
        let progress = task_db::get_ticket_progress(&engine.pool, ticket.id).await?;
        let progress_str = format!("{}/{}", progress.completed, progress.total);
        let title = if ticket.title.chars().count() > 28 {
            format!("{}...", ticket.title.chars().take(25).collect::<String>())
        } else {
            ticket.title.clone()
        };
        println!(
            "{:<38} {:<30} {:<12} {:<20} {:>10}",
            ticket.id,
            title,
            ticket.status.to_string(),
            ticket.phase_id.as_deref().unwrap_or("-"),
            progress_str,
        );
    }

    Ok(())
}
