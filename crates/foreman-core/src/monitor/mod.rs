//! Health monitor: periodic sweeps for stale agents, overdue tasks, and
//! stuck workflows.
//!
//! The three sweeps run independently; each accepts the shared cancellation
//! signal and exits between store transactions. The one-shot `*_once`
//! entry points carry the actual logic so tests can drive them against a
//! manual clock.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_db::queries::{events as event_db, tasks as task_db, tickets as ticket_db};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{self, BusEvent, StuckDetectedPayload, TaskOutcome, topics};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;

/// Cap on the evidence list attached to a stuck detection.
const STUCK_EVIDENCE_LIMIT: usize = 10;

pub struct HealthMonitor {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
}

impl HealthMonitor {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            pool,
            bus,
            clock,
            config,
            registry,
            queue,
        }
    }

    /// Run all three sweeps until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(
            self.heartbeat_loop(cancel.clone()),
            self.timeout_loop(cancel.clone()),
            self.stuck_loop(cancel),
        );
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_sweep_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    if let Err(e) = self.sweep_heartbeats_once(now).await {
                        tracing::error!(error = %e, "heartbeat sweep failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn timeout_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.task_timeout_sweep_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    if let Err(e) = self.sweep_timeouts_once(now).await {
                        tracing::error!(error = %e, "task timeout sweep failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn stuck_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.stuck_sweep_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    if let Err(e) = self.sweep_stuck_once(now).await {
                        tracing::error!(error = %e, "stuck workflow sweep failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// One heartbeat sweep: degrade stale agents and requeue their work.
    pub async fn sweep_heartbeats_once(&self, now: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
        self.registry
            .mark_stale(now, self.config.heartbeat_stale_s)
            .await
    }

    /// One timeout sweep over in-flight tasks.
    pub async fn sweep_timeouts_once(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<(Uuid, foreman_db::models::TaskStatus)>> {
        self.queue.sweep_timeouts(now).await
    }

    /// One stuck-workflow sweep.
    ///
    /// A ticket is stuck iff it has at least one task, every task is in a
    /// terminal status, no `workflow.result.validated` event exists for it,
    /// at least `stuck_threshold_s` has passed since the last task
    /// activity, and the previous stuck detection (if any) is older than
    /// `stuck_cooldown_s`. Detections are appended to the event table so
    /// the cooldown survives a restart.
    pub async fn sweep_stuck_once(&self, now: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
        let tickets = ticket_db::list_open_tickets(&self.pool).await?;
        let mut flagged = Vec::new();

        for ticket in tickets {
            let tasks = task_db::list_tasks_for_ticket(&self.pool, ticket.id).await?;
            if tasks.is_empty() {
                continue;
            }
            if !tasks.iter().all(|t| t.status.is_terminal()) {
                continue;
            }
            if event_db::has_event_of_type(
                &self.pool,
                topics::WORKFLOW_RESULT_VALIDATED,
                ticket.id,
            )
            .await?
            {
                continue;
            }
            let last_activity = task_db::last_activity_for_ticket(&self.pool, ticket.id)
                .await?
                .unwrap_or(ticket.created_at);
            if now - last_activity < Duration::seconds(self.config.stuck_threshold_s) {
                continue;
            }
            if let Some(previous) = event_db::latest_of_type(
                &self.pool,
                topics::DIAGNOSTIC_STUCK_DETECTED,
                ticket.id,
            )
            .await?
            {
                if now - previous.recorded_at < Duration::seconds(self.config.stuck_cooldown_s) {
                    continue;
                }
            }

            let evidence: Vec<TaskOutcome> = tasks
                .iter()
                .rev()
                .take(STUCK_EVIDENCE_LIMIT)
                .map(|t| TaskOutcome {
                    task_id: t.id,
                    status: t.status.to_string(),
                })
                .collect();
            let payload = StuckDetectedPayload {
                schema_version: events::SCHEMA_VERSION,
                ticket_id: ticket.id,
                phase_id: ticket.phase_id.clone(),
                evidence,
            };
            let value = events::payload_value(&payload);

            // Persisted so the cooldown can be re-derived from the store.
            let mut tx = self
                .pool
                .begin()
                .await
                .context("failed to begin stuck detection transaction")?;
            event_db::insert_event(
                &mut *tx,
                &event_db::NewEvent {
                    event_type: topics::DIAGNOSTIC_STUCK_DETECTED.to_owned(),
                    entity_type: "ticket".to_owned(),
                    entity_id: ticket.id,
                    payload: value.clone(),
                    recorded_at: now,
                },
            )
            .await?;
            tx.commit()
                .await
                .context("failed to commit stuck detection transaction")?;

            tracing::warn!(
                ticket_id = %ticket.id,
                phase_id = ?ticket.phase_id,
                "stuck workflow detected"
            );
            self.bus.publish(&BusEvent::new(
                topics::DIAGNOSTIC_STUCK_DETECTED,
                "ticket",
                ticket.id,
                value,
                now,
            ));
            flagged.push(ticket.id);
        }

        Ok(flagged)
    }
}
