//! Database query functions for the `tasks` table.
//!
//! Status transitions use optimistic locking: the UPDATE's WHERE clause
//! includes the expected current status, so a row changed by a concurrent
//! writer surfaces as zero rows affected. Every update bumps the row
//! version. Functions are generic over the executor so they compose inside
//! open transactions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Priority, Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub dependencies: Vec<Uuid>,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub not_before: DateTime<Utc>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, version).
pub async fn insert_task<'e, E>(exec: E, new: &NewTask) -> Result<Task>
where
    E: PgExecutor<'e>,
{
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (ticket_id, phase_id, task_type, description, priority, \
                            dependencies, max_retries, timeout_seconds, not_before) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(&new.phase_id)
    .bind(&new.task_type)
    .bind(&new.description)
    .bind(new.priority)
    .bind(Json(&new.dependencies))
    .bind(new.max_retries)
    .bind(new.timeout_seconds)
    .bind(new.not_before)
    .fetch_one(exec)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task<'e, E>(exec: E, id: Uuid) -> Result<Option<Task>>
where
    E: PgExecutor<'e>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single task by ID with a row lock (`FOR UPDATE`).
pub async fn get_task_for_update<'e, E>(exec: E, id: Uuid) -> Result<Option<Task>>
where
    E: PgExecutor<'e>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch task for update")?;

    Ok(task)
}

/// List all tasks for a given ticket, ordered by creation time.
pub async fn list_tasks_for_ticket<'e, E>(exec: E, ticket_id: Uuid) -> Result<Vec<Task>>
where
    E: PgExecutor<'e>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE ticket_id = $1 ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(exec)
    .await
    .context("failed to list tasks for ticket")?;

    Ok(tasks)
}

/// List all tasks for a ticket scoped to one phase, ordered by creation time.
pub async fn list_tasks_in_phase<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<Task>>
where
    E: PgExecutor<'e>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE ticket_id = $1 AND phase_id = $2 ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(exec)
    .await
    .context("failed to list tasks in phase")?;

    Ok(tasks)
}

/// List an agent's in-flight tasks with row locks, for requeueing when the
/// agent goes stale.
pub async fn list_inflight_for_agent<'e, E>(exec: E, agent_id: Uuid) -> Result<Vec<Task>>
where
    E: PgExecutor<'e>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE assigned_agent_id = $1 AND status IN ('assigned', 'running') \
         ORDER BY created_at ASC \
         FOR UPDATE",
    )
    .bind(agent_id)
    .fetch_all(exec)
    .await
    .context("failed to list in-flight tasks for agent")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Assignment path
// -----------------------------------------------------------------------

/// Score parameters for candidate ordering. `w_p` weights the priority
/// class, `w_a` weights normalised age; `w_p + w_a = 1`.
#[derive(Debug, Clone, Copy)]
pub struct CandidateParams {
    pub w_p: f64,
    pub w_a: f64,
    pub age_ceiling_s: f64,
}

/// Select and lock the best assignable candidate task.
///
/// A task is a candidate iff it is `pending`, its backoff window has
/// elapsed, its phase matches the filter (a `NULL` filter matches every
/// phase), and every dependency resolves to a `completed` task.
///
/// Candidates are ordered by the age-weighted priority score, then
/// `created_at`, then id. The winner is locked with
/// `FOR UPDATE SKIP LOCKED`, so a row already claimed by a concurrent
/// assignment is skipped rather than waited on; when every candidate is
/// locked this returns `None`.
pub async fn lock_next_candidate<'e, E>(
    exec: E,
    phase_filter: Option<&str>,
    now: DateTime<Utc>,
    params: &CandidateParams,
) -> Result<Option<Task>>
where
    E: PgExecutor<'e>,
{
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'pending' \
           AND t.not_before <= $1 \
           AND ($2::text IS NULL OR t.phase_id = $2) \
           AND NOT EXISTS ( \
               SELECT 1 \
               FROM jsonb_array_elements_text(t.dependencies) AS dep(dep_id) \
               LEFT JOIN tasks d ON d.id = dep.dep_id::uuid \
               WHERE d.id IS NULL OR d.status != 'completed' \
           ) \
         ORDER BY \
           ($3 * CASE t.priority \
                   WHEN 'critical' THEN 1.0 \
                   WHEN 'high' THEN 0.7 \
                   WHEN 'medium' THEN 0.4 \
                   ELSE 0.1 \
                 END \
            + $4 * LEAST(GREATEST(EXTRACT(EPOCH FROM ($1 - t.created_at))::double precision, 0.0) / $5, 1.0)) DESC, \
           t.created_at ASC, \
           t.id ASC \
         LIMIT 1 \
         FOR UPDATE OF t SKIP LOCKED",
    )
    .bind(now)
    .bind(phase_filter)
    .bind(params.w_p)
    .bind(params.w_a)
    .bind(params.age_ceiling_s)
    .fetch_optional(exec)
    .await
    .context("failed to lock next candidate task")?;

    Ok(task)
}

/// Claim a pending task for an agent: `pending -> assigned`.
pub async fn mark_assigned<'e, E>(exec: E, task_id: Uuid, agent_id: Uuid) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'assigned', assigned_agent_id = $2, version = version + 1 \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(task_id)
    .bind(agent_id)
    .execute(exec)
    .await
    .context("failed to mark task assigned")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// State transitions
// -----------------------------------------------------------------------

/// `assigned -> running`, setting `started_at`.
pub async fn mark_started<'e, E>(exec: E, task_id: Uuid, now: DateTime<Utc>) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', started_at = $2, version = version + 1 \
         WHERE id = $1 AND status = 'assigned'",
    )
    .bind(task_id)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark task started")?;

    Ok(result.rows_affected())
}

/// `running -> under_review`, storing the submitted result blob.
pub async fn mark_under_review<'e, E>(
    exec: E,
    task_id: Uuid,
    result_blob: &serde_json::Value,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'under_review', result = $2, version = version + 1 \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(task_id)
    .bind(result_blob)
    .execute(exec)
    .await
    .context("failed to mark task under review")?;

    Ok(result.rows_affected())
}

/// Transition a task to `completed` from the expected status, releasing the
/// agent. `result_blob` overwrites the stored result when provided.
pub async fn mark_completed<'e, E>(
    exec: E,
    task_id: Uuid,
    from: TaskStatus,
    result_blob: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', \
             result = COALESCE($3, result), \
             completed_at = $4, \
             assigned_agent_id = NULL, \
             version = version + 1 \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .bind(result_blob)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark task completed")?;

    Ok(result.rows_affected())
}

/// Return a task to `pending` for retry: increments `retry_count`, clears
/// the agent and `started_at`, and pushes `not_before` out by the backoff
/// delay.
pub async fn requeue_for_retry<'e, E>(
    exec: E,
    task_id: Uuid,
    from: TaskStatus,
    not_before: DateTime<Utc>,
    error_message: &str,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             assigned_agent_id = NULL, \
             started_at = NULL, \
             not_before = $3, \
             error_message = $4, \
             version = version + 1 \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .bind(not_before)
    .bind(error_message)
    .execute(exec)
    .await
    .context("failed to requeue task for retry")?;

    Ok(result.rows_affected())
}

/// Transition a task to `failed` from the expected status, releasing the
/// agent.
pub async fn mark_failed<'e, E>(
    exec: E,
    task_id: Uuid,
    from: TaskStatus,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', \
             error_message = $3, \
             completed_at = $4, \
             assigned_agent_id = NULL, \
             version = version + 1 \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .bind(error_message)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Transition a task to `cancelled` from the expected status, releasing the
/// agent.
pub async fn mark_cancelled<'e, E>(
    exec: E,
    task_id: Uuid,
    from: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', \
             completed_at = $3, \
             assigned_agent_id = NULL, \
             version = version + 1 \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark task cancelled")?;

    Ok(result.rows_affected())
}

/// Reject a reviewed result: `under_review -> running`, recording the
/// reviewer feedback in `error_message` for the next iteration.
pub async fn return_to_running<'e, E>(exec: E, task_id: Uuid, feedback: &str) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', error_message = $2, version = version + 1 \
         WHERE id = $1 AND status = 'under_review'",
    )
    .bind(task_id)
    .bind(feedback)
    .execute(exec)
    .await
    .context("failed to return task to running")?;

    Ok(result.rows_affected())
}

/// Mark every overdue in-flight task `timed_out` and return the affected
/// rows. A task is overdue when it has a deadline, has started, and
/// `started_at + timeout_seconds` has passed.
pub async fn sweep_mark_timed_out<'e, E>(exec: E, now: DateTime<Utc>) -> Result<Vec<Task>>
where
    E: PgExecutor<'e>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'timed_out', version = version + 1 \
         WHERE status IN ('assigned', 'running') \
           AND timeout_seconds IS NOT NULL \
           AND started_at IS NOT NULL \
           AND started_at + make_interval(secs => timeout_seconds::double precision) < $1 \
         RETURNING *",
    )
    .bind(now)
    .fetch_all(exec)
    .await
    .context("failed to sweep timed-out tasks")?;

    Ok(tasks)
}

/// Mark every pending task that depends on `dep_task_id` as `blocked`.
///
/// Uses JSONB containment against the `dependencies` array, so the GIN
/// index serves the lookup. Returns the IDs of the tasks that were blocked.
pub async fn mark_dependents_blocked<'e, E>(exec: E, dep_task_id: Uuid) -> Result<Vec<Uuid>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'blocked', version = version + 1 \
         WHERE status = 'pending' AND dependencies @> $1 \
         RETURNING id",
    )
    .bind(serde_json::json!([dep_task_id.to_string()]))
    .fetch_all(exec)
    .await
    .context("failed to mark dependent tasks blocked")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Requeue a blocked task: `blocked -> pending` (operator override after the
/// failed dependency has been dealt with).
pub async fn unblock_task<'e, E>(exec: E, task_id: Uuid) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', version = version + 1 \
         WHERE id = $1 AND status = 'blocked'",
    )
    .bind(task_id)
    .execute(exec)
    .await
    .context("failed to unblock task")?;

    Ok(result.rows_affected())
}

/// Overwrite a task's priority, guarded by the expected row version.
/// Affects future queue ordering only.
pub async fn update_priority<'e, E>(
    exec: E,
    task_id: Uuid,
    priority: Priority,
    expected_version: i64,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET priority = $2, version = version + 1 \
         WHERE id = $1 AND version = $3",
    )
    .bind(task_id)
    .bind(priority)
    .bind(expected_version)
    .execute(exec)
    .await
    .context("failed to update task priority")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Aggregates
// -----------------------------------------------------------------------

/// Status counts for a ticket's tasks.
#[derive(Debug, Clone, Default)]
pub struct TicketProgress {
    pub pending: i64,
    pub blocked: i64,
    pub assigned: i64,
    pub running: i64,
    pub under_review: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub timed_out: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given ticket.
pub async fn get_ticket_progress<'e, E>(exec: E, ticket_id: Uuid) -> Result<TicketProgress>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE ticket_id = $1 \
         GROUP BY status",
    )
    .bind(ticket_id)
    .fetch_all(exec)
    .await
    .context("failed to get ticket progress")?;

    let mut progress = TicketProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "blocked" => progress.blocked = *count,
            "assigned" => progress.assigned = *count,
            "running" => progress.running = *count,
            "under_review" => progress.under_review = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            "timed_out" => progress.timed_out = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Count tasks in a ticket's phase that are not yet in a terminal status.
pub async fn count_open_in_phase<'e, E>(exec: E, ticket_id: Uuid, phase_id: &str) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ticket_id = $1 AND phase_id = $2 \
           AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_one(exec)
    .await
    .context("failed to count open tasks in phase")?;

    Ok(row.0)
}

/// Count completed tasks in a ticket's phase.
pub async fn count_completed_in_phase<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ticket_id = $1 AND phase_id = $2 AND status = 'completed'",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_one(exec)
    .await
    .context("failed to count completed tasks in phase")?;

    Ok(row.0)
}

/// The most recently completed task in a ticket's phase, if any. Used to
/// read the successor nomination out of the result payload.
pub async fn latest_completed_in_phase<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Option<Task>>
where
    E: PgExecutor<'e>,
{
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ticket_id = $1 AND phase_id = $2 AND status = 'completed' \
         ORDER BY completed_at DESC NULLS LAST \
         LIMIT 1",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_optional(exec)
    .await
    .context("failed to fetch latest completed task in phase")?;

    Ok(task)
}

/// The latest task activity timestamp for a ticket: the newest of
/// `created_at`, `started_at`, and `completed_at` across its tasks.
pub async fn last_activity_for_ticket<'e, E>(
    exec: E,
    ticket_id: Uuid,
) -> Result<Option<DateTime<Utc>>>
where
    E: PgExecutor<'e>,
{
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
        "SELECT MAX(GREATEST(created_at, \
                             COALESCE(started_at, created_at), \
                             COALESCE(completed_at, created_at))) \
         FROM tasks WHERE ticket_id = $1",
    )
    .bind(ticket_id)
    .fetch_one(exec)
    .await
    .context("failed to fetch last task activity for ticket")?;

    Ok(row.0)
}

/// The dependency edges of every task in a ticket, for cycle detection.
pub async fn list_dependency_graph<'e, E>(
    exec: E,
    ticket_id: Uuid,
) -> Result<Vec<(Uuid, Vec<Uuid>)>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(Uuid, Json<Vec<Uuid>>)> =
        sqlx::query_as("SELECT id, dependencies FROM tasks WHERE ticket_id = $1")
            .bind(ticket_id)
            .fetch_all(exec)
            .await
            .context("failed to list dependency graph for ticket")?;

    Ok(rows.into_iter().map(|(id, deps)| (id, deps.0)).collect())
}
