//! Guardian: authority-gated emergency interventions with a written audit
//! trail.
//!
//! Every intervention checks the authority level before any transaction is
//! opened (an insufficient-authority attempt leaves no action row, only a
//! log line) and records a `GuardianAction` with a before/after snapshot in
//! the same transaction as the mutation it performs.

use std::sync::Arc;

use anyhow::Context as _;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use foreman_db::models::{GuardianAction, GuardianActionType, Priority};
use foreman_db::queries::{
    agents as agent_db, events as event_db, guardian_actions as action_db, tasks as task_db,
};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, BusEvent, GuardianEventPayload, topics};

pub struct Guardian {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Guardian {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            pool,
            bus,
            clock,
            config,
        }
    }

    /// Authority gate, applied before any state is touched. Failures are
    /// audit-logged but leave no action row.
    fn check_authority(
        &self,
        action_type: GuardianActionType,
        initiated_by: &str,
        authority: i32,
    ) -> EngineResult<()> {
        let required = self.config.guardian_min_authority;
        if authority < required {
            tracing::warn!(
                action_type = %action_type,
                initiated_by,
                required,
                given = authority,
                "guardian intervention rejected: insufficient authority"
            );
            return Err(EngineError::PermissionDenied {
                required,
                given: authority,
            });
        }
        Ok(())
    }

    /// Force a task to `cancelled`, releasing the holding agent's load.
    pub async fn cancel_task(
        &self,
        task_id: Uuid,
        reason: &str,
        initiated_by: &str,
        authority: i32,
    ) -> EngineResult<GuardianAction> {
        self.check_authority(GuardianActionType::CancelTask, initiated_by, authority)?;

        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin guardian cancel transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.status.is_terminal() {
            return Err(EngineError::IllegalTransition {
                entity: "task",
                id: task_id,
                from: task.status.to_string(),
                to: "cancelled".to_owned(),
            });
        }

        let before = serde_json::json!({
            "status": task.status.to_string(),
            "assigned_agent_id": task.assigned_agent_id,
        });
        if task_db::mark_cancelled(&mut *tx, task_id, task.status, now).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }
        if task.status.holds_agent() {
            if let Some(agent_id) = task.assigned_agent_id {
                agent_db::release_load(&mut *tx, agent_id).await?;
            }
        }
        let audit = serde_json::json!({
            "before": before,
            "after": { "status": "cancelled", "assigned_agent_id": null },
        });

        let action = self
            .record_action(
                &mut tx,
                GuardianActionType::CancelTask,
                task_id,
                authority,
                reason,
                initiated_by,
                audit,
            )
            .await?;

        tx.commit()
            .await
            .context("failed to commit guardian cancel transaction")?;

        tracing::warn!(
            action_id = %action.id,
            task_id = %task_id,
            initiated_by,
            reason,
            "guardian cancelled task"
        );
        self.publish_intervention(&action);
        Ok(action)
    }

    /// Move `amount` units of capacity from one agent to another.
    pub async fn reallocate_capacity(
        &self,
        from_agent: Uuid,
        to_agent: Uuid,
        amount: i32,
        reason: &str,
        initiated_by: &str,
        authority: i32,
    ) -> EngineResult<GuardianAction> {
        self.check_authority(
            GuardianActionType::ReallocateCapacity,
            initiated_by,
            authority,
        )?;
        if amount < 1 {
            return Err(EngineError::validation("amount must be at least 1"));
        }
        if from_agent == to_agent {
            return Err(EngineError::validation(
                "source and target agents must differ",
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin guardian reallocate transaction")?;

        // Lock both rows in id order so concurrent reallocations cannot
        // deadlock.
        let (first, second) = if from_agent < to_agent {
            (from_agent, to_agent)
        } else {
            (to_agent, from_agent)
        };
        agent_db::get_agent_for_update(&mut *tx, first)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", first))?;
        agent_db::get_agent_for_update(&mut *tx, second)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", second))?;

        let from = agent_db::get_agent(&mut *tx, from_agent)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", from_agent))?;
        let to = agent_db::get_agent(&mut *tx, to_agent)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", to_agent))?;

        let remaining = from.capacity - amount;
        if remaining < 0 || from.current_load + remaining < 0 {
            return Err(EngineError::validation(format!(
                "agent {from_agent} cannot give up {amount} of {} capacity",
                from.capacity
            )));
        }

        if agent_db::update_capacity(&mut *tx, from_agent, remaining, from.version).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "agent",
                id: from_agent,
            });
        }
        if agent_db::update_capacity(&mut *tx, to_agent, to.capacity + amount, to.version).await?
            == 0
        {
            return Err(EngineError::StaleVersion {
                entity: "agent",
                id: to_agent,
            });
        }

        let audit = serde_json::json!({
            "before": {
                "from": { "agent_id": from_agent, "capacity": from.capacity },
                "to": { "agent_id": to_agent, "capacity": to.capacity },
            },
            "after": {
                "from": { "agent_id": from_agent, "capacity": remaining },
                "to": { "agent_id": to_agent, "capacity": to.capacity + amount },
            },
        });

        let action = self
            .record_action(
                &mut tx,
                GuardianActionType::ReallocateCapacity,
                from_agent,
                authority,
                reason,
                initiated_by,
                audit,
            )
            .await?;

        tx.commit()
            .await
            .context("failed to commit guardian reallocate transaction")?;

        tracing::warn!(
            action_id = %action.id,
            from_agent = %from_agent,
            to_agent = %to_agent,
            amount,
            initiated_by,
            "guardian reallocated capacity"
        );
        self.publish_intervention(&action);
        Ok(action)
    }

    /// Overwrite a task's priority. Affects future queue ordering only; work
    /// already assigned is not preempted.
    pub async fn override_priority(
        &self,
        task_id: Uuid,
        new_priority: Priority,
        reason: &str,
        initiated_by: &str,
        authority: i32,
    ) -> EngineResult<GuardianAction> {
        self.check_authority(
            GuardianActionType::OverridePriority,
            initiated_by,
            authority,
        )?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin guardian override transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.status.is_terminal() {
            return Err(EngineError::validation(format!(
                "cannot override priority of {} task {task_id}",
                task.status
            )));
        }

        if task_db::update_priority(&mut *tx, task_id, new_priority, task.version).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }

        let audit = serde_json::json!({
            "before": { "priority": task.priority.to_string() },
            "after": { "priority": new_priority.to_string() },
        });
        let action = self
            .record_action(
                &mut tx,
                GuardianActionType::OverridePriority,
                task_id,
                authority,
                reason,
                initiated_by,
                audit,
            )
            .await?;

        tx.commit()
            .await
            .context("failed to commit guardian override transaction")?;

        tracing::warn!(
            action_id = %action.id,
            task_id = %task_id,
            priority = %new_priority,
            initiated_by,
            "guardian overrode task priority"
        );
        self.publish_intervention(&action);
        Ok(action)
    }

    /// Mark an action reverted. An auditing primitive only: side effects are
    /// not undone; restoring state is the caller's responsibility via
    /// further operations. Idempotent: reverting twice is a no-op.
    pub async fn revert(
        &self,
        action_id: Uuid,
        reason: &str,
        initiated_by: &str,
    ) -> EngineResult<GuardianAction> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin guardian revert transaction")?;

        let action = action_db::get_action(&mut *tx, action_id)
            .await?
            .ok_or_else(|| EngineError::not_found("guardian action", action_id))?;

        let rows = action_db::mark_reverted(&mut *tx, action_id, now).await?;
        if rows == 0 {
            // Already reverted.
            return Ok(action);
        }

        let payload = GuardianEventPayload {
            schema_version: events::SCHEMA_VERSION,
            action_id,
            action_type: action.action_type.to_string(),
            target_entity_id: action.target_entity_id,
            initiated_by: initiated_by.to_owned(),
        };
        event_db::insert_event(
            &mut *tx,
            &event_db::NewEvent {
                event_type: topics::GUARDIAN_INTERVENTION_REVERTED.to_owned(),
                entity_type: "guardian_action".to_owned(),
                entity_id: action_id,
                payload: events::payload_value(&payload),
                recorded_at: now,
            },
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit guardian revert transaction")?;

        tracing::warn!(
            action_id = %action_id,
            initiated_by,
            reason,
            "guardian action reverted"
        );
        self.bus.publish(&BusEvent::new(
            topics::GUARDIAN_INTERVENTION_REVERTED,
            "guardian_action",
            action_id,
            events::payload_value(&payload),
            now,
        ));
        self.get(action_id).await
    }

    pub async fn get(&self, action_id: Uuid) -> EngineResult<GuardianAction> {
        action_db::get_action(&self.pool, action_id)
            .await?
            .ok_or_else(|| EngineError::not_found("guardian action", action_id))
    }

    pub async fn list(&self, limit: i64) -> EngineResult<Vec<GuardianAction>> {
        Ok(action_db::list_actions(&self.pool, limit).await?)
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// Write the action row plus the durable started/completed events inside
    /// the intervention's transaction.
    #[allow(clippy::too_many_arguments)]
    async fn record_action(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        action_type: GuardianActionType,
        target_entity_id: Uuid,
        authority: i32,
        reason: &str,
        initiated_by: &str,
        audit_log: serde_json::Value,
    ) -> EngineResult<GuardianAction> {
        let action = action_db::insert_action(
            &mut **tx,
            &action_db::NewGuardianAction {
                action_type,
                target_entity_id,
                authority_level: authority,
                reason: reason.to_owned(),
                initiated_by: initiated_by.to_owned(),
                approved_by: None,
                audit_log,
            },
        )
        .await?;

        let payload = GuardianEventPayload {
            schema_version: events::SCHEMA_VERSION,
            action_id: action.id,
            action_type: action_type.to_string(),
            target_entity_id,
            initiated_by: initiated_by.to_owned(),
        };
        let value = events::payload_value(&payload);
        for topic in [
            topics::GUARDIAN_INTERVENTION_STARTED,
            topics::GUARDIAN_INTERVENTION_COMPLETED,
        ] {
            event_db::insert_event(
                &mut **tx,
                &event_db::NewEvent {
                    event_type: topic.to_owned(),
                    entity_type: "guardian_action".to_owned(),
                    entity_id: action.id,
                    payload: value.clone(),
                    recorded_at: self.clock.now(),
                },
            )
            .await?;
        }

        Ok(action)
    }

    fn publish_intervention(&self, action: &GuardianAction) {
        let payload = GuardianEventPayload {
            schema_version: events::SCHEMA_VERSION,
            action_id: action.id,
            action_type: action.action_type.to_string(),
            target_entity_id: action.target_entity_id,
            initiated_by: action.initiated_by.clone(),
        };
        let value = events::payload_value(&payload);
        let now = self.clock.now();
        for topic in [
            topics::GUARDIAN_INTERVENTION_STARTED,
            topics::GUARDIAN_INTERVENTION_COMPLETED,
        ] {
            self.bus.publish(&BusEvent::new(
                topic,
                "guardian_action",
                action.id,
                value.clone(),
                now,
            ));
        }
    }
}
