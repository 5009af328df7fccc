//! Workflow orchestrator: the engine's main loop.
//!
//! Each tick matches ready tasks to agents with spare capacity. Several
//! workers may run this loop concurrently; assignment is serialised
//! entirely by the store's row locks, so no worker holds any in-memory
//! state across a suspension point and cancellation needs nothing flushed.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::topics;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;

/// One scheduling pass: offer each available agent its next assignment.
///
/// Returns the number of assignments made. Transient store conflicts on a
/// single agent are logged and skipped; the next tick retries.
pub async fn tick_once(
    queue: &TaskQueue,
    registry: &AgentRegistry,
) -> EngineResult<usize> {
    let agents = registry.list_available().await?;
    let mut assigned = 0;

    for agent in agents {
        match queue.next_assignment(agent.id).await {
            Ok(Some(task)) => {
                tracing::debug!(
                    agent_id = %agent.id,
                    task_id = %task.id,
                    "orchestrator matched task to agent"
                );
                assigned += 1;
            }
            Ok(None) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    agent_id = %agent.id,
                    error = %e,
                    "assignment skipped on transient error"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Ok(assigned)
}

/// Run one orchestrator worker until cancelled.
///
/// The worker wakes on the tick timer or on a `task.created` event,
/// whichever comes first, and exits at the next safe point after
/// cancellation (never mid-transaction; the queue's transactions are
/// self-contained).
pub async fn run_orchestrator(
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    bus: EventBus,
    config: EngineConfig,
    cancel: CancellationToken,
) {
    let mut wake = bus.subscribe(topics::TASK_CREATED);
    let mut interval = tokio::time::interval(config.tick_period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = wake.recv() => {}
        }

        match tick_once(&queue, &registry).await {
            Ok(assigned) if assigned > 0 => {
                tracing::debug!(assigned, "orchestrator tick");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "orchestrator tick failed");
            }
        }
    }

    tracing::info!("orchestrator worker stopped");
}
