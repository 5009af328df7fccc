//! The durable priority task queue.
//!
//! Assignment, result intake, failure routing, and the timeout sweep all
//! run inside store transactions; the only locks in play are the row locks
//! taken between transaction start and commit. Concurrent `next_assignment`
//! callers are serialised purely by `FOR UPDATE SKIP LOCKED` on the
//! candidate row.

pub mod retry;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context as _;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Priority, Task, TaskStatus};
use foreman_db::queries::{events as event_db, phases as phase_db, tasks as task_db};
use foreman_db::queries::{agents as agent_db, tickets as ticket_db};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, BusEvent, TaskEventPayload, TaskResultEnvelope, topics};
use retry::{Retryability, RetryPolicy, classify_category};
use state::TaskStateMachine;

/// Bounded internal retries for optimistic-concurrency conflicts before the
/// failure surfaces to the caller.
const STALE_VERSION_RETRIES: u32 = 3;

/// Parameters for [`TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub dependencies: Vec<Uuid>,
    pub timeout_seconds: Option<i64>,
    /// Defaults to the configured `default_max_retries` when absent.
    pub max_retries: Option<i32>,
}

/// The outcome of routing a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task went back to `pending` with a back-off delay.
    Retried,
    /// The retry budget is exhausted or the failure was permanent.
    Failed,
}

pub struct TaskQueue {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    retry_policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let retry_policy = RetryPolicy::from_config(&config);
        Self {
            pool,
            bus,
            clock,
            config,
            retry_policy,
        }
    }

    // -------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------

    /// Create a `pending` task.
    ///
    /// Dependencies must name existing tasks of the same ticket, and the
    /// resulting dependency graph must stay acyclic.
    pub async fn enqueue(&self, req: EnqueueRequest) -> EngineResult<Task> {
        if req.description.trim().is_empty() {
            return Err(EngineError::validation("task description must not be empty"));
        }
        if let Some(timeout) = req.timeout_seconds {
            if timeout <= 0 {
                return Err(EngineError::validation("timeout_seconds must be positive"));
            }
        }
        if let Some(max_retries) = req.max_retries {
            if max_retries < 0 {
                return Err(EngineError::validation("max_retries must not be negative"));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin enqueue transaction")?;

        ticket_db::get_ticket(&mut *tx, req.ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", req.ticket_id))?;

        phase_db::get_phase(&mut *tx, &req.phase_id)
            .await?
            .ok_or_else(|| {
                EngineError::validation(format!("unknown phase {:?}", req.phase_id))
            })?;

        let mut seen = HashSet::new();
        for dep_id in &req.dependencies {
            if !seen.insert(*dep_id) {
                return Err(EngineError::validation(format!(
                    "duplicate dependency {dep_id}"
                )));
            }
            let dep = task_db::get_task(&mut *tx, *dep_id)
                .await?
                .ok_or_else(|| {
                    EngineError::validation(format!("dependency {dep_id} does not exist"))
                })?;
            if dep.ticket_id != req.ticket_id {
                return Err(EngineError::validation(format!(
                    "dependency {dep_id} belongs to a different ticket"
                )));
            }
        }

        // DFS over the ticket's existing graph plus the new edges.
        let mut graph = task_db::list_dependency_graph(&mut *tx, req.ticket_id).await?;
        let new_node = Uuid::new_v4(); // stand-in for the not-yet-inserted task
        graph.push((new_node, req.dependencies.clone()));
        if has_cycle(&graph) {
            return Err(EngineError::validation(
                "dependency cycle detected in ticket task graph",
            ));
        }

        let new_task = task_db::NewTask {
            ticket_id: req.ticket_id,
            phase_id: req.phase_id,
            task_type: req.task_type,
            description: req.description,
            priority: req.priority,
            dependencies: req.dependencies,
            max_retries: req.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_seconds: req.timeout_seconds,
            not_before: self.clock.now(),
        };
        let task = task_db::insert_task(&mut *tx, &new_task).await?;

        tx.commit()
            .await
            .context("failed to commit enqueue transaction")?;

        tracing::info!(
            task_id = %task.id,
            ticket_id = %task.ticket_id,
            phase_id = %task.phase_id,
            priority = %task.priority,
            "task enqueued"
        );
        self.publish_task_event(topics::TASK_CREATED, &task, None, None);
        Ok(task)
    }

    // -------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------

    /// Atomically claim the best eligible task for an agent.
    ///
    /// Returns `None` when no candidate exists or every candidate is locked
    /// by a concurrent assignment. Optimistic-concurrency conflicts are
    /// retried a bounded number of times.
    pub async fn next_assignment(&self, agent_id: Uuid) -> EngineResult<Option<Task>> {
        let mut attempt = 0;
        loop {
            match self.try_next_assignment(agent_id).await {
                Err(e) if e.is_retryable() && attempt + 1 < STALE_VERSION_RETRIES => {
                    attempt += 1;
                    tracing::debug!(
                        agent_id = %agent_id,
                        attempt,
                        error = %e,
                        "retrying assignment after transient conflict"
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_next_assignment(&self, agent_id: Uuid) -> EngineResult<Option<Task>> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin assignment transaction")?;

        let agent = agent_db::get_agent_for_update(&mut *tx, agent_id)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;

        if !agent.status.is_schedulable() || agent.current_load >= agent.capacity {
            return Ok(None);
        }

        let params = self.config.candidate_params();
        let Some(candidate) =
            task_db::lock_next_candidate(&mut *tx, agent.phase_id.as_deref(), now, &params).await?
        else {
            return Ok(None);
        };

        if task_db::mark_assigned(&mut *tx, candidate.id, agent.id).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: candidate.id,
            });
        }
        if agent_db::adjust_load(&mut *tx, agent.id, 1).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "agent",
                id: agent.id,
            });
        }

        let task = task_db::get_task(&mut *tx, candidate.id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", candidate.id))?;

        tx.commit()
            .await
            .context("failed to commit assignment transaction")?;

        tracing::info!(
            task_id = %task.id,
            agent_id = %agent_id,
            phase_id = %task.phase_id,
            "task assigned"
        );
        self.publish_task_event(topics::TASK_ASSIGNED, &task, None, None);
        Ok(Some(task))
    }

    // -------------------------------------------------------------------
    // Agent-driven transitions
    // -------------------------------------------------------------------

    /// `assigned -> running`. The claiming agent must match.
    pub async fn start(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin start transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        TaskStateMachine::ensure(&task, TaskStatus::Running)?;
        if task.assigned_agent_id != Some(agent_id) {
            return Err(EngineError::WrongAgent { task_id, agent_id });
        }
        if task_db::mark_started(&mut *tx, task_id, now).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }

        tx.commit()
            .await
            .context("failed to commit start transaction")?;

        self.publish_task_event(topics::TASK_STARTED, &task, Some(agent_id), None);
        Ok(())
    }

    /// Submit a task result.
    ///
    /// `running -> under_review` when the task's phase requires review,
    /// otherwise straight to `completed`. A `status_hint` of `"failed"`
    /// routes through the failure path instead, using the envelope's
    /// category for retry classification.
    pub async fn submit_result(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status_hint: Option<&str>,
        result: serde_json::Value,
    ) -> EngineResult<TaskStatus> {
        let envelope = TaskResultEnvelope::parse(&result)?;

        if status_hint == Some("failed") {
            let cause = envelope
                .summary
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_owned());
            let outcome = self
                .fail(task_id, agent_id, &cause, envelope.category.as_deref())
                .await?;
            return Ok(match outcome {
                FailureOutcome::Retried => TaskStatus::Pending,
                FailureOutcome::Failed => TaskStatus::Failed,
            });
        }

        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin submit transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        if task.status != TaskStatus::Running {
            return Err(EngineError::IllegalTransition {
                entity: "task",
                id: task_id,
                from: task.status.to_string(),
                to: "under_review/completed".to_owned(),
            });
        }
        if task.assigned_agent_id != Some(agent_id) {
            return Err(EngineError::WrongAgent { task_id, agent_id });
        }

        let phase = phase_db::get_phase(&mut *tx, &task.phase_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", task.phase_id.clone()))?;

        let final_status = if phase.requires_review {
            if task_db::mark_under_review(&mut *tx, task_id, &result).await? == 0 {
                return Err(EngineError::StaleVersion {
                    entity: "task",
                    id: task_id,
                });
            }
            TaskStatus::UnderReview
        } else {
            if task_db::mark_completed(&mut *tx, task_id, TaskStatus::Running, Some(&result), now)
                .await?
                == 0
            {
                return Err(EngineError::StaleVersion {
                    entity: "task",
                    id: task_id,
                });
            }
            agent_db::release_load(&mut *tx, agent_id).await?;
            self.record_completed(&mut tx, &task, Some(agent_id)).await?;
            TaskStatus::Completed
        };

        tx.commit()
            .await
            .context("failed to commit submit transaction")?;

        tracing::info!(
            task_id = %task_id,
            agent_id = %agent_id,
            status = %final_status,
            "task result submitted"
        );
        if final_status == TaskStatus::Completed {
            self.publish_task_event(topics::TASK_COMPLETED, &task, Some(agent_id), None);
        }
        Ok(final_status)
    }

    /// Approve a reviewed result: `under_review -> completed`.
    pub async fn approve(&self, task_id: Uuid) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin approve transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        if task.status != TaskStatus::UnderReview {
            return Err(EngineError::IllegalTransition {
                entity: "task",
                id: task_id,
                from: task.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        if task_db::mark_completed(&mut *tx, task_id, TaskStatus::UnderReview, None, now).await?
            == 0
        {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }
        if let Some(agent_id) = task.assigned_agent_id {
            agent_db::release_load(&mut *tx, agent_id).await?;
        }
        self.record_completed(&mut tx, &task, task.assigned_agent_id)
            .await?;

        tx.commit()
            .await
            .context("failed to commit approve transaction")?;

        self.publish_task_event(topics::TASK_COMPLETED, &task, task.assigned_agent_id, None);
        Ok(())
    }

    /// Reject a reviewed result: `under_review -> running` for another
    /// iteration, carrying the reviewer feedback to the agent.
    pub async fn reject(&self, task_id: Uuid, feedback: &str) -> EngineResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin reject transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        if task.status != TaskStatus::UnderReview {
            return Err(EngineError::IllegalTransition {
                entity: "task",
                id: task_id,
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        if task_db::return_to_running(&mut *tx, task_id, feedback).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }

        tx.commit()
            .await
            .context("failed to commit reject transaction")?;

        tracing::info!(task_id = %task_id, "task result rejected, new iteration");
        Ok(())
    }

    /// Report a task failure.
    ///
    /// Retryable failures with remaining budget return the task to
    /// `pending` with an exponential back-off; everything else lands in
    /// `failed` and marks dependents `blocked`.
    pub async fn fail(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        error_message: &str,
        category: Option<&str>,
    ) -> EngineResult<FailureOutcome> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin fail transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(EngineError::IllegalTransition {
                entity: "task",
                id: task_id,
                from: task.status.to_string(),
                to: TaskStatus::Failed.to_string(),
            });
        }
        if task.assigned_agent_id != Some(agent_id) {
            return Err(EngineError::WrongAgent { task_id, agent_id });
        }

        let retryable = classify_category(category) == Retryability::Retryable;
        let outcome = if retryable && task.retry_count < task.max_retries {
            let delay = self.retry_policy.backoff(task.retry_count + 1);
            let rows = task_db::requeue_for_retry(
                &mut *tx,
                task_id,
                task.status,
                now + delay,
                error_message,
            )
            .await?;
            if rows == 0 {
                return Err(EngineError::StaleVersion {
                    entity: "task",
                    id: task_id,
                });
            }
            FailureOutcome::Retried
        } else {
            let rows =
                task_db::mark_failed(&mut *tx, task_id, task.status, error_message, now).await?;
            if rows == 0 {
                return Err(EngineError::StaleVersion {
                    entity: "task",
                    id: task_id,
                });
            }
            let blocked = task_db::mark_dependents_blocked(&mut *tx, task_id).await?;
            for dep in &blocked {
                tracing::warn!(task_id = %dep, failed_dependency = %task_id, "task blocked");
            }
            FailureOutcome::Failed
        };
        agent_db::release_load(&mut *tx, agent_id).await?;

        tx.commit()
            .await
            .context("failed to commit fail transaction")?;

        tracing::warn!(
            task_id = %task_id,
            agent_id = %agent_id,
            retried = (outcome == FailureOutcome::Retried),
            error = error_message,
            "task failed"
        );
        self.publish_task_event(
            topics::TASK_FAILED,
            &task,
            Some(agent_id),
            Some((outcome == FailureOutcome::Retried, error_message)),
        );
        Ok(outcome)
    }

    /// Cancel a task. Terminal statuses reject the operation.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin cancel transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        TaskStateMachine::ensure(&task, TaskStatus::Cancelled)?;
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
        task_db::mark_dependents_blocked(&mut *tx, task_id).await?;

        tx.commit()
            .await
            .context("failed to commit cancel transaction")?;

        tracing::info!(task_id = %task_id, reason, "task cancelled");
        self.publish_task_event(
            topics::TASK_CANCELLED,
            &task,
            task.assigned_agent_id,
            Some((false, reason)),
        );
        Ok(())
    }

    /// Requeue a blocked task after its failed dependency has been dealt
    /// with: `blocked -> pending`.
    pub async fn unblock(&self, task_id: Uuid) -> EngineResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin unblock transaction")?;

        let task = task_db::get_task_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        TaskStateMachine::ensure(&task, TaskStatus::Pending)?;
        if task_db::unblock_task(&mut *tx, task_id).await? == 0 {
            return Err(EngineError::StaleVersion {
                entity: "task",
                id: task_id,
            });
        }

        tx.commit()
            .await
            .context("failed to commit unblock transaction")?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Timeout sweep
    // -------------------------------------------------------------------

    /// Mark overdue in-flight tasks `timed_out` and route each through the
    /// retry policy (timeouts are retryable). Returns each swept task and
    /// the status it ended in.
    pub async fn sweep_timeouts(&self, now: chrono::DateTime<chrono::Utc>) -> EngineResult<Vec<(Uuid, TaskStatus)>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin timeout sweep transaction")?;

        let timed_out = task_db::sweep_mark_timed_out(&mut *tx, now).await?;
        let mut outcomes = Vec::with_capacity(timed_out.len());

        for task in &timed_out {
            if let Some(agent_id) = task.assigned_agent_id {
                agent_db::release_load(&mut *tx, agent_id).await?;
            }
            let final_status = if task.retry_count < task.max_retries {
                let delay = self.retry_policy.backoff(task.retry_count + 1);
                task_db::requeue_for_retry(
                    &mut *tx,
                    task.id,
                    TaskStatus::TimedOut,
                    now + delay,
                    "task timed out",
                )
                .await?;
                TaskStatus::Pending
            } else {
                task_db::mark_failed(
                    &mut *tx,
                    task.id,
                    TaskStatus::TimedOut,
                    "task timed out, retry budget exhausted",
                    now,
                )
                .await?;
                task_db::mark_dependents_blocked(&mut *tx, task.id).await?;
                TaskStatus::Failed
            };
            outcomes.push((task.id, final_status));
        }

        tx.commit()
            .await
            .context("failed to commit timeout sweep transaction")?;

        for (task, (_, final_status)) in timed_out.iter().zip(&outcomes) {
            tracing::warn!(
                task_id = %task.id,
                final_status = %final_status,
                "task timed out"
            );
            self.publish_task_event(
                topics::TASK_TIMED_OUT,
                task,
                task.assigned_agent_id,
                Some((*final_status == TaskStatus::Pending, "task timed out")),
            );
        }
        Ok(outcomes)
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// Append the durable `task.completed` row inside the open transaction.
    async fn record_completed(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task: &Task,
        agent_id: Option<Uuid>,
    ) -> EngineResult<()> {
        let payload = TaskEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id: task.ticket_id,
            phase_id: task.phase_id.clone(),
            agent_id,
            retryable: None,
            cause: None,
        };
        event_db::insert_event(
            &mut **tx,
            &event_db::NewEvent {
                event_type: topics::TASK_COMPLETED.to_owned(),
                entity_type: "task".to_owned(),
                entity_id: task.id,
                payload: events::payload_value(&payload),
                recorded_at: self.clock.now(),
            },
        )
        .await?;
        Ok(())
    }

    fn publish_task_event(
        &self,
        topic: &str,
        task: &Task,
        agent_id: Option<Uuid>,
        failure: Option<(bool, &str)>,
    ) {
        let payload = TaskEventPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id: task.ticket_id,
            phase_id: task.phase_id.clone(),
            agent_id,
            retryable: failure.map(|(retryable, _)| retryable),
            cause: failure.map(|(_, cause)| cause.to_owned()),
        };
        self.bus.publish(&BusEvent::new(
            topic,
            "task",
            task.id,
            events::payload_value(&payload),
            self.clock.now(),
        ));
    }
}

/// Detect a cycle in a dependency edge list with an iterative DFS.
fn has_cycle(graph: &[(Uuid, Vec<Uuid>)]) -> bool {
    let edges: HashMap<Uuid, &Vec<Uuid>> =
        graph.iter().map(|(id, deps)| (*id, deps)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }
    let mut marks: HashMap<Uuid, Mark> = HashMap::new();

    for (start, _) in graph {
        if marks.contains_key(start) {
            continue;
        }
        // Stack of (node, next-child-index).
        let mut stack: Vec<(Uuid, usize)> = vec![(*start, 0)];
        marks.insert(*start, Mark::InProgress);

        while let Some((node, child_idx)) = stack.pop() {
            let deps = edges.get(&node).map(|d| d.as_slice()).unwrap_or(&[]);
            if child_idx < deps.len() {
                stack.push((node, child_idx + 1));
                let child = deps[child_idx];
                match marks.get(&child) {
                    Some(Mark::InProgress) => return true,
                    Some(Mark::Done) => {}
                    None => {
                        if edges.contains_key(&child) {
                            marks.insert(child, Mark::InProgress);
                            stack.push((child, 0));
                        }
                        // Edges to tasks outside the ticket were rejected
                        // earlier; unknown ids cannot form a cycle here.
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    false
}
