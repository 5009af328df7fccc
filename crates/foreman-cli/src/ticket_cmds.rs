//! Ticket subcommands.

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_db::models::Priority;
use foreman_db::queries::{tasks as task_db, tickets as ticket_db};

use crate::TicketCommands;

pub async fn run(engine: &Engine, command: TicketCommands) -> Result<()> {
    match command {
        TicketCommands::Create {
            title,
            description,
            priority,
        } => {
            let priority: Priority = priority.parse()?;
            let ticket = engine
                .phases
                .create_ticket(&title, &description, priority)
                .await?;
            println!("Created ticket {}", ticket.id);
            Ok(())
        }
        TicketCommands::Show { ticket_id } => {
            let id = parse_id(&ticket_id)?;
            let ticket = engine.phases.get_ticket(id).await?;
            println!("Ticket: {} ({})", ticket.title, ticket.id);
            println!("Status: {}", ticket.status);
            println!("Priority: {}", ticket.priority);
            match &ticket.phase_id {
                Some(phase) => println!("Phase: {phase}"),
                None => println!("Phase: (not started)"),
            }
            println!();

            let tasks = task_db::list_tasks_for_ticket(&engine.pool, id).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            } else {
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
            }
            Ok(())
        }
        TicketCommands::List => {
            let tickets = ticket_db::list_tickets(&engine.pool).await?;
            if tickets.is_empty() {
                println!("No tickets found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<30} {:<12} {:<10} {:<20}",
                "ID", "TITLE", "STATUS", "PRIORITY", "PHASE"
            );
            println!("{}", "-".repeat(112));
            for ticket in &tickets {
                let title = if ticket.title.chars().count() > 28 {
                    format!("{}...", ticket.title.chars().take(25).collect::<String>())
                } else {
                    ticket.title.clone()
                };
                println!(
                    "{:<38} {:<30} {:<12} {:<10} {:<20}",
                    ticket.id,
                    title,
                    ticket.status.to_string(),
                    ticket.priority.to_string(),
                    ticket.phase_id.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        TicketCommands::Start { ticket_id } => {
            let id = parse_id(&ticket_id)?;
            let ticket = engine.phases.start_ticket(id).await?;
            println!(
                "Ticket {} started in phase {}",
                ticket.id,
                ticket.phase_id.as_deref().unwrap_or("?")
            );
            Ok(())
        }
        TicketCommands::Block { ticket_id, reason } => {
            let id = parse_id(&ticket_id)?;
            engine.phases.block(id, &reason).await?;
            println!("Ticket {id} blocked");
            Ok(())
        }
        TicketCommands::Unblock { ticket_id } => {
            let id = parse_id(&ticket_id)?;
            engine.phases.unblock(id).await?;
            println!("Ticket {id} unblocked");
            Ok(())
        }
        TicketCommands::Regress {
            ticket_id,
            to_phase,
            reason,
        } => {
            let id = parse_id(&ticket_id)?;
            engine.phases.regress(id, &to_phase, &reason).await?;
            println!("Ticket {id} regressed to {to_phase}");
            Ok(())
        }
        TicketCommands::Submit {
            ticket_id,
            artifact_kind,
            artifact_ref,
        } => {
            let id = parse_id(&ticket_id)?;
            let submission = engine
                .intake
                .submit(id, &artifact_kind, &artifact_ref)
                .await?;
            println!(
                "Submission {} {} ({})",
                submission.id, submission.status, submission.artifact_kind
            );
            Ok(())
        }
    }
}

fn parse_id(input: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid ticket ID: {input}"))
}

pub(crate) fn status_icon(status: &str) -> &'static str {
    match status {
        "pending" => ".",
        "blocked" => "#",
        "assigned" => ">",
        "running" => "*",
        "under_review" => "?",
        "completed" => "+",
        "failed" => "!",
        "cancelled" => "x",
        "timed_out" => "T",
        _ => " ",
    }
}
