//! Result intake: receives workflow result submissions, validates the
//! artifact against the ticket's current phase gate, and writes the
//! satisfaction flags the phase engine reads.
//!
//! Intake never advances tickets itself; it publishes
//! `workflow.result.validated` and the engine wiring routes that back into
//! the phase engine's gate evaluation.

use std::sync::Arc;

use anyhow::Context as _;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Phase, SubmissionStatus, WorkflowSubmission};
use foreman_db::queries::{
    events as event_db, phases as phase_db, submissions as submission_db, tickets as ticket_db,
};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, BusEvent, WorkflowResultPayload, topics};

/// The gate criteria a validated artifact of `kind` satisfies.
///
/// Criterion `i` is bound to `expected_outputs[i]`; when there are more
/// criteria than output kinds, the surplus criteria bind to the last kind.
pub fn criteria_for_artifact(phase: &Phase, kind: &str) -> Vec<i32> {
    if phase.expected_outputs.is_empty() {
        return Vec::new();
    }
    let last = phase.expected_outputs.len() - 1;
    (0..phase.done_definitions.len())
        .filter(|&i| phase.expected_outputs[i.min(last)] == kind)
        .map(|i| i as i32)
        .collect()
}

pub struct ResultIntake {
    pool: PgPool,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl ResultIntake {
    pub fn new(pool: PgPool, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { pool, bus, clock }
    }

    /// Submit a workflow result artifact for a ticket's current phase.
    ///
    /// A kind named in the phase's `expected_outputs` validates and marks
    /// its bound gate criteria satisfied. Anything else is recorded as
    /// rejected and surfaces as a validation error, so the audit trail
    /// keeps the attempt either way.
    pub async fn submit(
        &self,
        ticket_id: Uuid,
        artifact_kind: &str,
        artifact_ref: &str,
    ) -> EngineResult<WorkflowSubmission> {
        if artifact_ref.trim().is_empty() {
            return Err(EngineError::validation("artifact_ref must not be empty"));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin intake transaction")?;

        let ticket = ticket_db::get_ticket(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))?;
        let Some(phase_id) = ticket.phase_id.clone() else {
            return Err(EngineError::validation(
                "ticket has no active phase to submit results for",
            ));
        };
        let phase = phase_db::get_phase(&mut *tx, &phase_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", phase_id.clone()))?;

        let submission = submission_db::insert_submission(
            &mut *tx,
            &submission_db::NewSubmission {
                ticket_id,
                phase_id: phase_id.clone(),
                artifact_kind: artifact_kind.to_owned(),
                artifact_ref: artifact_ref.to_owned(),
            },
        )
        .await?;
        self.record_result_event(
            &mut tx,
            topics::WORKFLOW_RESULT_SUBMITTED,
            &submission,
        )
        .await?;

        let accepted = phase.expected_outputs.iter().any(|k| k == artifact_kind);
        if !accepted {
            submission_db::set_submission_status(
                &mut *tx,
                submission.id,
                SubmissionStatus::Rejected,
            )
            .await?;
            self.record_result_event(
                &mut tx,
                topics::WORKFLOW_RESULT_REJECTED,
                &submission,
            )
            .await?;
            tx.commit()
                .await
                .context("failed to commit intake transaction")?;

            tracing::warn!(
                ticket_id = %ticket_id,
                artifact_kind,
                phase_id = %phase_id,
                "workflow result rejected: unexpected artifact kind"
            );
            self.publish_result_event(topics::WORKFLOW_RESULT_SUBMITTED, &submission);
            self.publish_result_event(topics::WORKFLOW_RESULT_REJECTED, &submission);
            return Err(EngineError::validation(format!(
                "artifact kind {artifact_kind:?} does not satisfy the gate of phase {phase_id}"
            )));
        }

        submission_db::set_submission_status(&mut *tx, submission.id, SubmissionStatus::Validated)
            .await?;
        for criterion in criteria_for_artifact(&phase, artifact_kind) {
            submission_db::insert_satisfaction(
                &mut *tx,
                ticket_id,
                &phase_id,
                criterion,
                submission.id,
            )
            .await?;
        }
        self.record_result_event(&mut tx, topics::WORKFLOW_RESULT_VALIDATED, &submission)
            .await?;

        tx.commit()
            .await
            .context("failed to commit intake transaction")?;

        tracing::info!(
            ticket_id = %ticket_id,
            submission_id = %submission.id,
            artifact_kind,
            phase_id = %phase_id,
            "workflow result validated"
        );
        self.publish_result_event(topics::WORKFLOW_RESULT_SUBMITTED, &submission);
        self.publish_result_event(topics::WORKFLOW_RESULT_VALIDATED, &submission);

        submission_db::get_submission(&self.pool, submission.id)
            .await?
            .ok_or_else(|| EngineError::not_found("submission", submission.id))
    }

    async fn record_result_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        topic: &str,
        submission: &WorkflowSubmission,
    ) -> EngineResult<()> {
        let payload = self.result_payload(submission);
        event_db::insert_event(
            &mut **tx,
            &event_db::NewEvent {
                event_type: topic.to_owned(),
                entity_type: "ticket".to_owned(),
                entity_id: submission.ticket_id,
                payload: events::payload_value(&payload),
                recorded_at: self.clock.now(),
            },
        )
        .await?;
        Ok(())
    }

    fn publish_result_event(&self, topic: &str, submission: &WorkflowSubmission) {
        let payload = self.result_payload(submission);
        self.bus.publish(&BusEvent::new(
            topic,
            "ticket",
            submission.ticket_id,
            events::payload_value(&payload),
            self.clock.now(),
        ));
    }

    fn result_payload(&self, submission: &WorkflowSubmission) -> WorkflowResultPayload {
        WorkflowResultPayload {
            schema_version: events::SCHEMA_VERSION,
            ticket_id: submission.ticket_id,
            submission_id: submission.id,
            phase_id: submission.phase_id.clone(),
            artifact_kind: submission.artifact_kind.clone(),
        }
    }
}
