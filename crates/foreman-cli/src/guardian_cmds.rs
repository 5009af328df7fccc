//! Guardian intervention subcommands.

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_db::models::Priority;

use crate::GuardianCommands;

pub async fn run(engine: &Engine, command: GuardianCommands) -> Result<()> {
    match command {
        GuardianCommands::CancelTask {
            task_id,
            reason,
            initiated_by,
            authority,
        } => {
            let action = engine
                .guardian
                .cancel_task(parse_id(&task_id)?, &reason, &initiated_by, authority)
                .await?;
            println!("Cancelled task {task_id} (action {})", action.id);
            Ok(())
        }
        GuardianCommands::Reallocate {
            from_agent,
            to_agent,
            amount,
            reason,
            initiated_by,
            authority,
        } => {
            let action = engine
                .guardian
                .reallocate_capacity(
                    parse_id(&from_agent)?,
                    parse_id(&to_agent)?,
                    amount,
                    &reason,
                    &initiated_by,
                    authority,
                )
                .await?;
            println!(
                "Moved {amount} capacity {from_agent} -> {to_agent} (action {})",
                action.id
            );
            Ok(())
        }
        GuardianCommands::OverridePriority {
            task_id,
            new_priority,
            reason,
            initiated_by,
            authority,
        } => {
            let priority: Priority = new_priority.parse()?;
            let action = engine
                .guardian
                .override_priority(
                    parse_id(&task_id)?,
                    priority,
                    &reason,
                    &initiated_by,
                    authority,
                )
                .await?;
            println!(
                "Task {task_id} priority set to {priority} (action {})",
                action.id
            );
            Ok(())
        }
        GuardianCommands::Revert {
            action_id,
            reason,
            initiated_by,
        } => {
            let action = engine
                .guardian
                .revert(parse_id(&action_id)?, &reason, &initiated_by)
                .await?;
            match action.reverted_at {
                Some(at) => println!("Action {} reverted at {}", action.id, at),
                None => println!("Action {} was already reverted", action.id),
            }
            Ok(())
        }
        GuardianCommands::Actions { limit } => {
            let actions = engine.guardian.list(limit).await?;
            if actions.is_empty() {
                println!("No guardian actions recorded.");
                return Ok(());
            }
            println!(
                "{:<38} {:<22} {:<38} {:<12} {:<10}",
                "ID", "TYPE", "TARGET", "BY", "REVERTED"
            );
            println!("{}", "-".repeat(124));
            for action in &actions {
                println!(
                    "{:<38} {:<22} {:<38} {:<12} {:<10}",
                    action.id,
                    action.action_type.to_string(),
                    action.target_entity_id,
                    action.initiated_by,
                    if action.reverted_at.is_some() {
                        "yes"
                    } else {
                        "no"
                    },
                );
            }
            Ok(())
        }
    }
}

fn parse_id(input: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid ID: {input}"))
}
