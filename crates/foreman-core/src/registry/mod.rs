//! Agent registry: lifecycle of agent records, heartbeat accounting, and
//! capability/capacity lookup.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Agent, AgentStatus, AgentType};
use foreman_db::queries::{agents as agent_db, phases as phase_db, tasks as task_db};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, AgentEventPayload, BusEvent, TaskEventPayload, topics};
use crate::queue::retry::RetryPolicy;

/// Parameters for [`AgentRegistry::register`].
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    /// Max concurrent tasks. Defaults to 1 when absent.
    pub capacity: Option<i32>,
    /// Workers may be scoped to a single phase.
    pub phase_id: Option<String>,
}

/// The authority level an agent type holds by default.
fn default_authority(agent_type: AgentType) -> i32 {
    match agent_type {
        AgentType::Worker => 1,
        AgentType::Monitor => 2,
        AgentType::Watchdog => 3,
        AgentType::Guardian => 4,
    }
}

pub struct AgentRegistry {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl AgentRegistry {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let retry_policy = RetryPolicy::from_config(&config);
        Self {
            pool,
            bus,
            clock,
            retry_policy,
        }
    }

    /// Register a new agent with status `idle` and zero load.
    pub async fn register(&self, req: RegisterRequest) -> EngineResult<Agent> {
        let capacity = req.capacity.unwrap_or(1);
        if capacity < 1 {
            return Err(EngineError::validation("agent capacity must be at least 1"));
        }
        if let Some(phase_id) = &req.phase_id {
            let phase = phase_db::get_phase(&self.pool, phase_id).await?;
            if phase.is_none() {
                return Err(EngineError::validation(format!(
                    "unknown phase {phase_id:?}"
                )));
            }
        }

        let agent = agent_db::insert_agent(
            &self.pool,
            &agent_db::NewAgent {
                agent_type: req.agent_type,
                phase_id: req.phase_id,
                capabilities: req.capabilities,
                capacity,
                authority_level: default_authority(req.agent_type),
            },
        )
        .await?;

        tracing::info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            capacity = agent.capacity,
            "agent registered"
        );
        self.publish_agent_event(topics::AGENT_REGISTERED, &agent);
        Ok(agent)
    }

    /// Record a heartbeat, optionally updating the agent's status.
    ///
    /// Only `idle` and `busy` may be self-reported; the engine owns the
    /// degraded/failed/terminated states. Idempotent apart from
    /// `last_heartbeat`.
    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        status_hint: Option<AgentStatus>,
    ) -> EngineResult<()> {
        if let Some(status) = status_hint {
            if !status.is_schedulable() {
                return Err(EngineError::validation(format!(
                    "agents may not self-report status {status}"
                )));
            }
        }
        let now = self.clock.now();
        let rows = agent_db::update_heartbeat(&self.pool, agent_id, now, status_hint).await?;
        if rows == 0 {
            return Err(EngineError::not_found("agent", agent_id));
        }
        self.bus.publish(&BusEvent::new(
            topics::AGENT_HEARTBEAT,
            "agent",
            agent_id,
            serde_json::json!({ "schema_version": events::SCHEMA_VERSION }),
            now,
        ));
        Ok(())
    }

    /// Agents able to take work in `phase_id` with the given capabilities,
    /// ordered by load ascending, then most recent heartbeat, then id.
    pub async fn find_eligible(
        &self,
        phase_id: &str,
        required_capabilities: &[String],
    ) -> EngineResult<Vec<Agent>> {
        let agents = agent_db::find_eligible(&self.pool, phase_id, required_capabilities).await?;
        Ok(agents)
    }

    /// All agents currently able to receive assignments.
    pub async fn list_available(&self) -> EngineResult<Vec<Agent>> {
        Ok(agent_db::list_available(&self.pool).await?)
    }

    pub async fn list(&self) -> EngineResult<Vec<Agent>> {
        Ok(agent_db::list_agents(&self.pool).await?)
    }

    pub async fn get(&self, agent_id: Uuid) -> EngineResult<Agent> {
        agent_db::get_agent(&self.pool, agent_id)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", agent_id))
    }

    /// Degrade agents whose heartbeat predates `now - threshold` (strict)
    /// and requeue their in-flight work with the retry budget consumed.
    ///
    /// Returns the degraded agents' ids.
    pub async fn mark_stale(
        &self,
        now: DateTime<Utc>,
        threshold_seconds: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let cutoff = now - Duration::seconds(threshold_seconds);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin stale sweep transaction")?;

        let stale_agents = agent_db::mark_stale(&mut *tx, cutoff).await?;
        let mut requeued: Vec<(foreman_db::models::Task, bool)> = Vec::new();

        for agent in &stale_agents {
            let inflight = task_db::list_inflight_for_agent(&mut *tx, agent.id).await?;
            for task in inflight {
                let retried = if task.retry_count < task.max_retries {
                    let delay = self.retry_policy.backoff(task.retry_count + 1);
                    task_db::requeue_for_retry(
                        &mut *tx,
                        task.id,
                        task.status,
                        now + delay,
                        "agent heartbeat lost mid-run",
                    )
                    .await?;
                    true
                } else {
                    task_db::mark_failed(
                        &mut *tx,
                        task.id,
                        task.status,
                        "agent heartbeat lost, retry budget exhausted",
                        now,
                    )
                    .await?;
                    task_db::mark_dependents_blocked(&mut *tx, task.id).await?;
                    false
                };
                agent_db::release_load(&mut *tx, agent.id).await?;
                requeued.push((task, retried));
            }
        }

        tx.commit()
            .await
            .context("failed to commit stale sweep transaction")?;

        for agent in &stale_agents {
            tracing::warn!(
                agent_id = %agent.id,
                last_heartbeat = %agent.last_heartbeat,
                "agent went stale"
            );
            self.publish_agent_event(topics::AGENT_STALE, agent);
        }
        for (task, retried) in &requeued {
            let payload = TaskEventPayload {
                schema_version: events::SCHEMA_VERSION,
                ticket_id: task.ticket_id,
                phase_id: task.phase_id.clone(),
                agent_id: task.assigned_agent_id,
                retryable: Some(*retried),
                cause: Some("agent heartbeat lost mid-run".to_owned()),
            };
            self.bus.publish(&BusEvent::new(
                topics::TASK_FAILED,
                "task",
                task.id,
                events::payload_value(&payload),
                now,
            ));
        }

        Ok(stale_agents.into_iter().map(|a| a.id).collect())
    }

    /// Take an agent out of service. Rejected while the agent still holds
    /// in-flight work.
    pub async fn terminate(&self, agent_id: Uuid) -> EngineResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin terminate transaction")?;

        let agent = agent_db::get_agent_for_update(&mut *tx, agent_id)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        if agent.current_load > 0 {
            return Err(EngineError::validation(format!(
                "agent {agent_id} still holds {} in-flight task(s)",
                agent.current_load
            )));
        }
        agent_db::set_status(&mut *tx, agent_id, AgentStatus::Terminated).await?;

        tx.commit()
            .await
            .context("failed to commit terminate transaction")?;

        self.bus.publish(&BusEvent::new(
            topics::AGENT_TERMINATED,
            "agent",
            agent_id,
            serde_json::json!({ "schema_version": events::SCHEMA_VERSION }),
            self.clock.now(),
        ));
        Ok(())
    }

    fn publish_agent_event(&self, topic: &str, agent: &Agent) {
        let payload = AgentEventPayload {
            schema_version: events::SCHEMA_VERSION,
            agent_type: agent.agent_type.to_string(),
            status: agent.status.to_string(),
        };
        self.bus.publish(&BusEvent::new(
            topic,
            "agent",
            agent.id,
            events::payload_value(&payload),
            self.clock.now(),
        ));
    }
}
