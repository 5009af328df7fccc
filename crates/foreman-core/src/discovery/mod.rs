//! Discovery service: records that an agent found additional work mid-task
//! and atomically branches a new task from it.

use std::sync::Arc;

use anyhow::Context as _;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Discovery, DiscoveryType, Priority, Task};
use foreman_db::queries::{discoveries as discovery_db, phases as phase_db, tasks as task_db};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, BusEvent, DiscoveryEventPayload, TaskEventPayload, topics};

/// Parameters for [`DiscoveryService::record_and_branch`].
#[derive(Debug, Clone)]
pub struct BranchRequest {
    pub source_task_id: Uuid,
    pub discovery_type: DiscoveryType,
    pub description: String,
    pub spawn_phase_id: String,
    pub spawn_description: String,
    /// Explicit priority for the branched task; defaults to the source
    /// task's priority.
    pub spawn_priority: Option<Priority>,
    /// Bump the spawned task one level above the resolved priority.
    pub priority_boost: bool,
}

pub struct DiscoveryService {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl DiscoveryService {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            pool,
            bus,
            clock,
            config,
        }
    }

    /// In one transaction: write the discovery row and enqueue the branched
    /// task in the nominated phase.
    ///
    /// The spawned task's priority is `spawn_priority` (or the source
    /// task's) raised one level when `priority_boost` is set.
    pub async fn record_and_branch(&self, req: BranchRequest) -> EngineResult<(Discovery, Task)> {
        if req.description.trim().is_empty() {
            return Err(EngineError::validation(
                "discovery description must not be empty",
            ));
        }
        if req.spawn_description.trim().is_empty() {
            return Err(EngineError::validation(
                "spawn description must not be empty",
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin discovery transaction")?;

        let source = task_db::get_task(&mut *tx, req.source_task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", req.source_task_id))?;

        phase_db::get_phase(&mut *tx, &req.spawn_phase_id)
            .await?
            .ok_or_else(|| {
                EngineError::validation(format!("unknown spawn phase {:?}", req.spawn_phase_id))
            })?;

        let mut priority = req.spawn_priority.unwrap_or(source.priority);
        if req.priority_boost {
            priority = priority.boosted();
        }

        let spawned = task_db::insert_task(
            &mut *tx,
            &task_db::NewTask {
                ticket_id: source.ticket_id,
                phase_id: req.spawn_phase_id.clone(),
                task_type: "discovery_branch".to_owned(),
                description: req.spawn_description.clone(),
                priority,
                dependencies: Vec::new(),
                max_retries: self.config.default_max_retries,
                timeout_seconds: None,
                not_before: self.clock.now(),
            },
        )
        .await?;

        let discovery = discovery_db::insert_discovery(
            &mut *tx,
            &discovery_db::NewDiscovery {
                source_task_id: source.id,
                discovery_type: req.discovery_type,
                description: req.description.clone(),
                spawn_phase_id: req.spawn_phase_id.clone(),
                spawn_task_id: spawned.id,
                priority_boost: req.priority_boost,
            },
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit discovery transaction")?;

        tracing::info!(
            discovery_id = %discovery.id,
            source_task_id = %source.id,
            spawned_task_id = %spawned.id,
            discovery_type = %req.discovery_type,
            priority = %spawned.priority,
            "discovery recorded and branched"
        );

        let now = self.clock.now();
        let payload = DiscoveryEventPayload {
            schema_version: events::SCHEMA_VERSION,
            source_task_id: source.id,
            spawned_task_id: spawned.id,
            discovery_type: req.discovery_type.to_string(),
        };
        self.bus.publish(&BusEvent::new(
            topics::DISCOVERY_RECORDED,
            "discovery",
            discovery.id,
            events::payload_value(&payload),
            now,
        ));
        let task_payload = TaskEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id: spawned.ticket_id,
            phase_id: spawned.phase_id.clone(),
            agent_id: None,
            retryable: None,
            cause: None,
        };
        self.bus.publish(&BusEvent::new(
            topics::TASK_CREATED,
            "task",
            spawned.id,
            events::payload_value(&task_payload),
            now,
        ));

        Ok((discovery, spawned))
    }

    pub async fn list_for_task(&self, task_id: Uuid) -> EngineResult<Vec<Discovery>> {
        Ok(discovery_db::list_for_source_task(&self.pool, task_id).await?)
    }
}
