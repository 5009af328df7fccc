//! Phase engine: the ticket state machine and phase-gate evaluation.
//!
//! Tickets move through the declarative phase catalog. A phase's gate
//! passes when every task scoped to the phase is terminal, at least one
//! completed successfully, and every `done_definitions` criterion has been
//! satisfied by a validated workflow submission (Result Intake writes those
//! flags; this engine only reads them).

pub mod catalog;

use std::sync::Arc;

use anyhow::Context as _;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use foreman_db::models::{Phase, Priority, Task, Ticket, TicketStatus};
use foreman_db::queries::{
    events as event_db, phases as phase_db, submissions as submission_db, tasks as task_db,
    tickets as ticket_db,
};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, BusEvent, PhaseEventPayload, TaskEventPayload, topics};

/// The ticket state machine.
///
/// ```text
/// pending     -> in_progress | cancelled
/// in_progress -> blocked | completed | failed | cancelled
/// blocked     -> in_progress | failed | cancelled
/// ```
pub fn is_valid_ticket_transition(from: TicketStatus, to: TicketStatus) -> bool {
    use TicketStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Cancelled)
            | (InProgress, Blocked)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Blocked, InProgress)
            | (Blocked, Failed)
            | (Blocked, Cancelled)
    )
}

fn ensure_ticket_transition(
    ticket: &Ticket,
    to: TicketStatus,
) -> EngineResult<()> {
    if is_valid_ticket_transition(ticket.status, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            entity: "ticket",
            id: ticket.id,
            from: ticket.status.to_string(),
            to: to.to_string(),
        })
    }
}

/// What a gate evaluation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Phase tasks still open or gate criteria unsatisfied.
    NotReady,
    /// Transitioned to the named phase.
    Advanced { to_phase: String },
    /// Transitioned onto a terminal phase; the ticket is completed.
    Completed,
    /// Several successors allowed and no valid nomination; ticket blocked.
    Ambiguous,
}

pub struct PhaseEngine {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl PhaseEngine {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            pool,
            bus,
            clock,
            config,
        }
    }

    // -------------------------------------------------------------------
    // Ticket lifecycle
    // -------------------------------------------------------------------

    /// Create a ticket in `pending`. The engine assigns the phase when the
    /// ticket is started.
    pub async fn create_ticket(
        &self,
        title: &str,
        description: &str,
        priority: Priority,
    ) -> EngineResult<Ticket> {
        if title.trim().is_empty() {
            return Err(EngineError::validation("ticket title must not be empty"));
        }
        let ticket = ticket_db::insert_ticket(
            &self.pool,
            &ticket_db::NewTicket {
                title: title.to_owned(),
                description: description.to_owned(),
                priority,
                phase_id: None,
            },
        )
        .await?;

        tracing::info!(ticket_id = %ticket.id, title, "ticket created");
        self.bus.publish(&BusEvent::new(
            topics::TICKET_CREATED,
            "ticket",
            ticket.id,
            serde_json::json!({ "schema_version": events::SCHEMA_VERSION }),
            self.clock.now(),
        ));
        Ok(ticket)
    }

    pub async fn get_ticket(&self, ticket_id: Uuid) -> EngineResult<Ticket> {
        ticket_db::get_ticket(&self.pool, ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))
    }

    /// Start a pending ticket: place it on the workflow's initial phase and
    /// enqueue that phase's seed task.
    pub async fn start_ticket(&self, ticket_id: Uuid) -> EngineResult<Ticket> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin start-ticket transaction")?;

        let ticket = ticket_db::get_ticket_for_update(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;
        ensure_ticket_transition(&ticket, TicketStatus::InProgress)?;

        let initial = phase_db::initial_phase(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::Fatal("phase catalog is empty".to_owned()))?;

        let rows = ticket_db::set_phase(
            &mut *tx,
            ticket_id,
            &initial.id,
            Some(TicketStatus::InProgress),
            ticket.version,
            now,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::StaleVersion {
                entity: "ticket",
                id: ticket_id,
            });
        }

        let seed = self.seed_phase_task(&mut tx, &ticket, &initial).await?;
        let publish = self
            .record_phase_transition(&mut tx, ticket_id, None, Some(&initial.id), "ticket started")
            .await?;

        tx.commit()
            .await
            .context("failed to commit start-ticket transaction")?;

        tracing::info!(
            ticket_id = %ticket_id,
            phase_id = %initial.id,
            "ticket started"
        );
        self.bus.publish(&publish);
        if let Some(task) = seed {
            self.publish_task_created(&task);
        }
        self.get_ticket(ticket_id).await
    }

    /// Explicitly block a ticket.
    pub async fn block(&self, ticket_id: Uuid, reason: &str) -> EngineResult<()> {
        let now = self.clock.now();
        let ticket = self.get_ticket(ticket_id).await?;
        ensure_ticket_transition(&ticket, TicketStatus::Blocked)?;
        let rows = ticket_db::transition_status(
            &self.pool,
            ticket_id,
            ticket.status,
            TicketStatus::Blocked,
            now,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::StaleVersion {
                entity: "ticket",
                id: ticket_id,
            });
        }
        tracing::info!(ticket_id = %ticket_id, reason, "ticket blocked");
        self.publish_phase_event(
            topics::TICKET_BLOCKED,
            ticket_id,
            ticket.phase_id.as_deref(),
            None,
            reason,
        );
        Ok(())
    }

    /// Unblock a ticket back to `in_progress`.
    pub async fn unblock(&self, ticket_id: Uuid) -> EngineResult<()> {
        let now = self.clock.now();
        let ticket = self.get_ticket(ticket_id).await?;
        ensure_ticket_transition(&ticket, TicketStatus::InProgress)?;
        let rows = ticket_db::transition_status(
            &self.pool,
            ticket_id,
            ticket.status,
            TicketStatus::InProgress,
            now,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::StaleVersion {
                entity: "ticket",
                id: ticket_id,
            });
        }
        tracing::info!(ticket_id = %ticket_id, "ticket unblocked");
        self.publish_phase_event(
            topics::TICKET_UNBLOCKED,
            ticket_id,
            ticket.phase_id.as_deref(),
            None,
            "unblocked",
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Gate evaluation
    // -------------------------------------------------------------------

    /// Bus-driven entry point: a task completed somewhere; re-evaluate its
    /// ticket if the task belongs to the ticket's current phase.
    pub async fn on_task_completed(&self, task_id: Uuid) -> EngineResult<AdvanceOutcome> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        let ticket = self.get_ticket(task.ticket_id).await?;
        if ticket.phase_id.as_deref() != Some(task.phase_id.as_str()) {
            return Ok(AdvanceOutcome::NotReady);
        }
        self.try_advance(task.ticket_id).await
    }

    /// Evaluate the current phase's gate and transition when it passes.
    pub async fn try_advance(&self, ticket_id: Uuid) -> EngineResult<AdvanceOutcome> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin advance transaction")?;

        let ticket = ticket_db::get_ticket_for_update(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;
        if ticket.status != TicketStatus::InProgress {
            return Ok(AdvanceOutcome::NotReady);
        }
        let Some(phase_id) = ticket.phase_id.clone() else {
            return Ok(AdvanceOutcome::NotReady);
        };
        let phase = phase_db::get_phase(&mut *tx, &phase_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", phase_id.clone()))?;

        if task_db::count_open_in_phase(&mut *tx, ticket_id, &phase_id).await? > 0 {
            return Ok(AdvanceOutcome::NotReady);
        }
        if task_db::count_completed_in_phase(&mut *tx, ticket_id, &phase_id).await? == 0 {
            return Ok(AdvanceOutcome::NotReady);
        }
        let satisfied = submission_db::count_satisfied(&mut *tx, ticket_id, &phase_id).await?;
        if satisfied < phase.done_definitions.len() as i64 {
            return Ok(AdvanceOutcome::NotReady);
        }

        // Gate passed; pick the successor.
        let successor = match phase.allowed_transitions.len() {
            0 => None,
            1 => Some(phase.allowed_transitions[0].clone()),
            _ => self.nominated_successor(&mut tx, &ticket, &phase).await?,
        };

        let outcome = match successor {
            None if phase.allowed_transitions.is_empty() => {
                // End of the chain: complete the ticket in place.
                ensure_ticket_transition(&ticket, TicketStatus::Completed)?;
                ticket_db::transition_status(
                    &mut *tx,
                    ticket_id,
                    ticket.status,
                    TicketStatus::Completed,
                    now,
                )
                .await?;
                let publish = self
                    .record_phase_transition(
                        &mut tx,
                        ticket_id,
                        Some(&phase_id),
                        None,
                        "phase gate passed, workflow complete",
                    )
                    .await?;
                tx.commit()
                    .await
                    .context("failed to commit advance transaction")?;
                self.bus.publish(&publish);
                self.publish_phase_event(
                    topics::TICKET_COMPLETED,
                    ticket_id,
                    Some(&phase_id),
                    None,
                    "workflow complete",
                );
                AdvanceOutcome::Completed
            }
            None => {
                // Multiple successors, no valid nomination.
                ensure_ticket_transition(&ticket, TicketStatus::Blocked)?;
                ticket_db::transition_status(
                    &mut *tx,
                    ticket_id,
                    ticket.status,
                    TicketStatus::Blocked,
                    now,
                )
                .await?;
                tx.commit()
                    .await
                    .context("failed to commit advance transaction")?;
                tracing::warn!(
                    ticket_id = %ticket_id,
                    phase_id = %phase_id,
                    "ambiguous successor, ticket blocked"
                );
                self.publish_phase_event(
                    topics::PHASE_AMBIGUOUS,
                    ticket_id,
                    Some(&phase_id),
                    None,
                    "no successor nominated",
                );
                AdvanceOutcome::Ambiguous
            }
            Some(next_id) => {
                let next = phase_db::get_phase(&mut *tx, &next_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Fatal(format!(
                            "phase catalog names unknown successor {next_id:?}"
                        ))
                    })?;

                let new_status = if next.is_terminal {
                    ensure_ticket_transition(&ticket, TicketStatus::Completed)?;
                    Some(TicketStatus::Completed)
                } else {
                    None
                };
                let rows = ticket_db::set_phase(
                    &mut *tx,
                    ticket_id,
                    &next_id,
                    new_status,
                    ticket.version,
                    now,
                )
                .await?;
                if rows == 0 {
                    return Err(EngineError::StaleVersion {
                        entity: "ticket",
                        id: ticket_id,
                    });
                }

                let seed = if next.is_terminal {
                    None
                } else {
                    self.seed_phase_task(&mut tx, &ticket, &next).await?
                };
                let publish = self
                    .record_phase_transition(
                        &mut tx,
                        ticket_id,
                        Some(&phase_id),
                        Some(&next_id),
                        "phase gate passed",
                    )
                    .await?;

                tx.commit()
                    .await
                    .context("failed to commit advance transaction")?;

                tracing::info!(
                    ticket_id = %ticket_id,
                    from_phase = %phase_id,
                    to_phase = %next_id,
                    "phase transitioned"
                );
                self.bus.publish(&publish);
                if let Some(task) = seed {
                    self.publish_task_created(&task);
                }
                if next.is_terminal {
                    self.publish_phase_event(
                        topics::TICKET_COMPLETED,
                        ticket_id,
                        Some(&next_id),
                        None,
                        "workflow complete",
                    );
                    AdvanceOutcome::Completed
                } else {
                    AdvanceOutcome::Advanced { to_phase: next_id }
                }
            }
        };

        Ok(outcome)
    }

    /// Regress a ticket to an earlier phase, cancelling the current phase's
    /// open tasks and seeding the target phase.
    pub async fn regress(
        &self,
        ticket_id: Uuid,
        to_phase_id: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin regress transaction")?;

        let ticket = ticket_db::get_ticket_for_update(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;
        if ticket.status.is_terminal() {
            return Err(EngineError::IllegalTransition {
                entity: "ticket",
                id: ticket_id,
                from: ticket.status.to_string(),
                to: TicketStatus::InProgress.to_string(),
            });
        }
        let Some(current_id) = ticket.phase_id.clone() else {
            return Err(EngineError::validation("ticket has no current phase"));
        };
        let current = phase_db::get_phase(&mut *tx, &current_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", current_id.clone()))?;
        let target = phase_db::get_phase(&mut *tx, to_phase_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", to_phase_id.to_owned()))?;
        if target.sequence_order >= current.sequence_order {
            return Err(EngineError::validation(format!(
                "regress target {to_phase_id} is not an earlier phase than {current_id}"
            )));
        }

        // Cancel open tasks in the current phase, releasing any held agents.
        let tasks = task_db::list_tasks_in_phase(&mut *tx, ticket_id, &current_id).await?;
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            task_db::mark_cancelled(&mut *tx, task.id, task.status, now).await?;
            if task.status.holds_agent() {
                if let Some(agent_id) = task.assigned_agent_id {
                    foreman_db::queries::agents::release_load(&mut *tx, agent_id).await?;
                }
            }
        }

        let rows = ticket_db::set_phase(
            &mut *tx,
            ticket_id,
            to_phase_id,
            Some(TicketStatus::InProgress),
            ticket.version,
            now,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::StaleVersion {
                entity: "ticket",
                id: ticket_id,
            });
        }

        let seed = self.seed_phase_task(&mut tx, &ticket, &target).await?;
        let publish = self
            .record_phase_transition(&mut tx, ticket_id, Some(&current_id), Some(to_phase_id), reason)
            .await?;

        tx.commit()
            .await
            .context("failed to commit regress transaction")?;

        tracing::info!(
            ticket_id = %ticket_id,
            from_phase = %current_id,
            to_phase = %to_phase_id,
            reason,
            "ticket regressed"
        );
        self.bus.publish(&publish);
        if let Some(task) = seed {
            self.publish_task_created(&task);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// Read the successor nominated by the most recent completed task's
    /// result payload. An invalid nomination counts as no nomination.
    async fn nominated_successor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ticket: &Ticket,
        phase: &Phase,
    ) -> EngineResult<Option<String>> {
        let Some(latest) =
            task_db::latest_completed_in_phase(&mut **tx, ticket.id, &phase.id).await?
        else {
            return Ok(None);
        };
        let Some(result) = &latest.result else {
            return Ok(None);
        };
        let nominated = result
            .get("next_phase")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        Ok(nominated.filter(|n| phase.allowed_transitions.iter().any(|t| t == n)))
    }

    /// Enqueue the seed task a phase template defines, if any.
    async fn seed_phase_task(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ticket: &Ticket,
        phase: &Phase,
    ) -> EngineResult<Option<Task>> {
        if phase.initial_prompt.is_empty() {
            return Ok(None);
        }
        let task = task_db::insert_task(
            &mut **tx,
            &task_db::NewTask {
                ticket_id: ticket.id,
                phase_id: phase.id.clone(),
                task_type: "seed".to_owned(),
                description: phase.initial_prompt.clone(),
                priority: ticket.priority,
                dependencies: Vec::new(),
                max_retries: self.config.default_max_retries,
                timeout_seconds: None,
                not_before: self.clock.now(),
            },
        )
        .await?;
        Ok(Some(task))
    }

    /// Append the durable `phase.transitioned` row inside the open
    /// transaction and hand back the bus event to publish after commit.
    async fn record_phase_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ticket_id: Uuid,
        from_phase: Option<&str>,
        to_phase: Option<&str>,
        reason: &str,
    ) -> EngineResult<BusEvent> {
        let payload = PhaseEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id,
            from_phase: from_phase.map(str::to_owned),
            to_phase: to_phase.map(str::to_owned),
            reason: reason.to_owned(),
        };
        let value = events::payload_value(&payload);
        event_db::insert_event(
            &mut **tx,
            &event_db::NewEvent {
                event_type: topics::PHASE_TRANSITIONED.to_owned(),
                entity_type: "ticket".to_owned(),
                entity_id: ticket_id,
                payload: value.clone(),
                recorded_at: self.clock.now(),
            },
        )
        .await?;
        Ok(BusEvent::new(
            topics::PHASE_TRANSITIONED,
            "ticket",
            ticket_id,
            value,
            self.clock.now(),
        ))
    }

    fn publish_phase_event(
        &self,
        topic: &str,
        ticket_id: Uuid,
        from_phase: Option<&str>,
        to_phase: Option<&str>,
        reason: &str,
    ) {
        let payload = PhaseEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id,
            from_phase: from_phase.map(str::to_owned),
            to_phase: to_phase.map(str::to_owned),
            reason: reason.to_owned(),
        };
        self.bus.publish(&BusEvent::new(
            topic,
            "ticket",
            ticket_id,
            events::payload_value(&payload),
            self.clock.now(),
        ));
    }

    fn publish_task_created(&self, task: &Task) {
        let payload = TaskEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id: task.ticket_id,
            phase_id: task.phase_id.clone(),
            agent_id: None,
            retryable: None,
            cause: None,
        };
        self.bus.publish(&BusEvent::new(
            topics::TASK_CREATED,
            "task",
            task.id,
            events::payload_value(&payload),
            self.clock.now(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketStatus::*;

    #[test]
    fn valid_ticket_transitions() {
        let valid = [
            (Pending, InProgress),
            (Pending, Cancelled),
            (InProgress, Blocked),
            (InProgress, Completed),
            (InProgress, Failed),
            (InProgress, Cancelled),
            (Blocked, InProgress),
            (Blocked, Failed),
            (Blocked, Cancelled),
        ];
        for (from, to) in &valid {
            assert!(
                is_valid_ticket_transition(*from, *to),
                "expected {from} -> {to} to be valid"
            );
        }
    }

    #[test]
    fn invalid_ticket_transitions() {
        let invalid = [
            (Pending, Blocked),
            (Pending, Completed),
            (Pending, Failed),
            (Blocked, Completed),
            (Completed, InProgress),
            (Failed, InProgress),
            (Cancelled, InProgress),
            (Completed, Failed),
        ];
        for (from, to) in &invalid {
            assert!(
                !is_valid_ticket_transition(*from, *to),
                "expected {from} -> {to} to be invalid"
            );
        }
    }
}
