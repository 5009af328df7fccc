//! Database query functions for the `workflow_submissions` and
//! `gate_satisfactions` tables.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{GateSatisfaction, SubmissionStatus, WorkflowSubmission};

/// Parameters for inserting a workflow result submission.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub artifact_kind: String,
    pub artifact_ref: String,
}

/// Insert a submission row with status `submitted`.
pub async fn insert_submission<'e, E>(exec: E, new: &NewSubmission) -> Result<WorkflowSubmission>
where
    E: PgExecutor<'e>,
{
    let submission = sqlx::query_as::<_, WorkflowSubmission>(
        "INSERT INTO workflow_submissions (ticket_id, phase_id, artifact_kind, artifact_ref) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.ticket_id)
    .bind(&new.phase_id)
    .bind(&new.artifact_kind)
    .bind(&new.artifact_ref)
    .fetch_one(exec)
    .await
    .context("failed to insert workflow submission")?;

    Ok(submission)
}

/// Fetch a single submission by ID.
pub async fn get_submission<'e, E>(exec: E, id: Uuid) -> Result<Option<WorkflowSubmission>>
where
    E: PgExecutor<'e>,
{
    let submission = sqlx::query_as::<_, WorkflowSubmission>(
        "SELECT * FROM workflow_submissions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await
    .context("failed to fetch workflow submission")?;

    Ok(submission)
}

/// Update a submission's validation status.
pub async fn set_submission_status<'e, E>(
    exec: E,
    id: Uuid,
    status: SubmissionStatus,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let result =
        sqlx::query("UPDATE workflow_submissions SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(exec)
            .await
            .context("failed to set submission status")?;

    Ok(result.rows_affected())
}

/// Record that a gate criterion was satisfied by a submission. Idempotent:
/// a criterion already satisfied keeps its original satisfying submission.
pub async fn insert_satisfaction<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
    criterion_index: i32,
    submission_id: Uuid,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO gate_satisfactions (ticket_id, phase_id, criterion_index, submission_id) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT DO NOTHING",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .bind(criterion_index)
    .bind(submission_id)
    .execute(exec)
    .await
    .context("failed to insert gate satisfaction")?;

    Ok(())
}

/// List the satisfied criteria for a ticket's phase.
pub async fn list_satisfactions<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<GateSatisfaction>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, GateSatisfaction>(
        "SELECT * FROM gate_satisfactions \
         WHERE ticket_id = $1 AND phase_id = $2 \
         ORDER BY criterion_index ASC",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(exec)
    .await
    .context("failed to list gate satisfactions")?;

    Ok(rows)
}

/// Count distinct satisfied criteria for a ticket's phase.
pub async fn count_satisfied<'e, E>(exec: E, ticket_id: Uuid, phase_id: &str) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM gate_satisfactions \
         WHERE ticket_id = $1 AND phase_id = $2",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_one(exec)
    .await
    .context("failed to count gate satisfactions")?;

    Ok(row.0)
}

/// List submissions for a ticket's phase, oldest first.
pub async fn list_for_phase<'e, E>(
    exec: E,
    ticket_id: Uuid,
    phase_id: &str,
) -> Result<Vec<WorkflowSubmission>>
where
    E: PgExecutor<'e>,
{
    let submissions = sqlx::query_as::<_, WorkflowSubmission>(
        "SELECT * FROM workflow_submissions \
         WHERE ticket_id = $1 AND phase_id = $2 \
         ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .bind(phase_id)
    .fetch_all(exec)
    .await
    .context("failed to list submissions for phase")?;

    Ok(submissions)
}
