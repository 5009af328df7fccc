//! Agent subcommands.

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_core::Engine;
use foreman_core::registry::RegisterRequest;
use foreman_db::models::{AgentStatus, AgentType};

use crate::AgentCommands;

pub async fn run(engine: &Engine, command: AgentCommands) -> Result<()> {
    match command {
        AgentCommands::Register {
            agent_type,
            capability,
            capacity,
            phase,
        } => {
            let agent_type: AgentType = agent_type.parse()?;
            let agent = engine
                .registry
                .register(RegisterRequest {
                    agent_type,
                    capabilities: capability,
                    capacity,
                    phase_id: phase,
                })
                .await?;
            println!("Registered agent {}", agent.id);
            println!("Type: {} (authority {})", agent.agent_type, agent.authority_level);
            println!("Capacity: {}", agent.capacity);
            Ok(())
        }
        AgentCommands::List => {
            let agents = engine.registry.list().await?;
            if agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<12} {:>6} {:<20}",
                "ID", "TYPE", "STATUS", "LOAD", "PHASE"
            );
            println!("{}", "-".repeat(90));
            for agent in &agents {
                println!(
                    "{:<38} {:<10} {:<12} {:>3}/{:<3} {:<20}",
                    agent.id,
                    agent.agent_type.to_string(),
                    agent.status.to_string(),
                    agent.current_load,
                    agent.capacity,
                    agent.phase_id.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        AgentCommands::Heartbeat { agent_id, status } => {
            let status = status.map(|s| s.parse::<AgentStatus>()).transpose()?;
            engine
                .registry
                .heartbeat(parse_id(&agent_id)?, status)
                .await?;
            println!("Heartbeat recorded for {agent_id}");
            Ok(())
        }
        AgentCommands::Terminate { agent_id } => {
            engine.registry.terminate(parse_id(&agent_id)?).await?;
            println!("Agent {agent_id} terminated");
            Ok(())
        }
    }
}

fn parse_id(input: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid agent ID: {input}"))
}
