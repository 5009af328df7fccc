//! Task subcommands, including the agent-mode operations (assign, start,
//! submit, fail, discover).

use std::io::Read;

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_core::discovery::BranchRequest;
use foreman_core::queue::EnqueueRequest;
use foreman_db::models::{DiscoveryType, Priority};
use foreman_db::queries::tasks as task_db;

use crate::TaskCommands;

pub async fn run(engine: &Engine, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Enqueue {
            ticket_id,
            phase_id,
            description,
            task_type,
            priority,
            depends_on,
            timeout_seconds,
            max_retries,
        } => {
            let priority: Priority = priority.parse()?;
            let dependencies = depends_on
                .iter()
                .map(|s| parse_id(s, "dependency"))
                .collect::<Result<Vec<_>>>()?;
            let task = engine
                .queue
                .enqueue(EnqueueRequest {
                    ticket_id: parse_id(&ticket_id, "ticket")?,
                    phase_id,
                    task_type,
                    description,
                    priority,
                    dependencies,
                    timeout_seconds,
                    max_retries,
                })
                .await?;
            println!("Enqueued task {}", task.id);
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let id = parse_id(&task_id, "task")?;
            let task = task_db::get_task(&engine.pool, id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            println!("Task: {} ({})", task.id, task.task_type);
            println!("Ticket: {}", task.ticket_id);
            println!("Phase: {}", task.phase_id);
            println!("Status: {}", task.status);
            println!("Priority: {}", task.priority);
            println!("Retries: {}/{}", task.retry_count, task.max_retries);
            if let Some(agent) = task.assigned_agent_id {
                println!("Agent: {agent}");
            }
            if !task.dependencies.0.is_empty() {
                println!("Depends on:");
                for dep in task.dependencies.0.iter() {
                    println!("  {dep}");
                }
            }
            if let Some(error) = &task.error_message {
                println!("Last error: {error}");
            }
            println!("Description:\n  {}", task.description.replace('\n', "\n  "));
            Ok(())
        }
        TaskCommands::Assign { agent_id } => {
            let agent = parse_id(&agent_id, "agent")?;
            match engine.queue.next_assignment(agent).await? {
                Some(task) => {
                    println!("Assigned task {}", task.id);
                    println!("Phase: {}", task.phase_id);
                    println!("Description:\n  {}", task.description.replace('\n', "\n  "));
                }
                None => println!("No eligible task."),
            }
            Ok(())
        }
        TaskCommands::Start { task_id, agent_id } => {
            engine
                .queue
                .start(parse_id(&task_id, "task")?, parse_id(&agent_id, "agent")?)
                .await?;
            println!("Task {task_id} running");
            Ok(())
        }
        TaskCommands::Submit {
            task_id,
            agent_id,
            result_file,
            status_hint,
        } => {
            let raw = read_input(&result_file)?;
            let result: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("result file {result_file} is not valid JSON"))?;
            let status = engine
                .queue
                .submit_result(
                    parse_id(&task_id, "task")?,
                    parse_id(&agent_id, "agent")?,
                    status_hint.as_deref(),
                    result,
                )
                .await?;
            println!("Task {task_id} is now {status}");
            Ok(())
        }
        TaskCommands::Fail {
            task_id,
            agent_id,
            error,
            category,
        } => {
            let outcome = engine
                .queue
                .fail(
                    parse_id(&task_id, "task")?,
                    parse_id(&agent_id, "agent")?,
                    &error,
                    category.as_deref(),
                )
                .await?;
            println!("Task {task_id}: {outcome:?}");
            Ok(())
        }
        TaskCommands::Cancel { task_id, reason } => {
            engine
                .queue
                .cancel(parse_id(&task_id, "task")?, &reason)
                .await?;
            println!("Task {task_id} cancelled");
            Ok(())
        }
        TaskCommands::Approve { task_id } => {
            engine.queue.approve(parse_id(&task_id, "task")?).await?;
            println!("Task {task_id} approved");
            Ok(())
        }
        TaskCommands::Reject { task_id, feedback } => {
            engine
                .queue
                .reject(parse_id(&task_id, "task")?, &feedback)
                .await?;
            println!("Task {task_id} rejected back to the agent");
            Ok(())
        }
        TaskCommands::Unblock { task_id } => {
            engine.queue.unblock(parse_id(&task_id, "task")?).await?;
            println!("Task {task_id} requeued");
            Ok(())
        }
        TaskCommands::Discover {
            source_task_id,
            discovery_type,
            description,
            spawn_phase,
            spawn_description,
            spawn_priority,
            boost,
        } => {
            let discovery_type: DiscoveryType = discovery_type.parse()?;
            let spawn_priority = spawn_priority
                .map(|p| p.parse::<Priority>())
                .transpose()?;
            let (discovery, task) = engine
                .discovery
                .record_and_branch(BranchRequest {
                    source_task_id: parse_id(&source_task_id, "task")?,
                    discovery_type,
                    description,
                    spawn_phase_id: spawn_phase,
                    spawn_description,
                    spawn_priority,
                    priority_boost: boost,
                })
                .await?;
            println!("Recorded discovery {}", discovery.id);
            println!("Branched task {} ({})", task.id, task.priority);
            Ok(())
        }
    }
}

fn parse_id(input: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid {what} ID: {input}"))
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read result from stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))
    }
}
