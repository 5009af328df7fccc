//! Event taxonomy and payload shapes.
//!
//! Topics are dot-namespaced and closed: adding one is a code change. Every
//! payload that crosses a component boundary carries an explicit
//! `schema_version` and rejects unknown fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Current payload schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// The closed set of event topics.
pub mod topics {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_TIMED_OUT: &str = "task.timed_out";
    pub const TASK_CANCELLED: &str = "task.cancelled";

    pub const TICKET_CREATED: &str = "ticket.created";
    pub const TICKET_BLOCKED: &str = "ticket.blocked";
    pub const TICKET_UNBLOCKED: &str = "ticket.unblocked";
    pub const TICKET_COMPLETED: &str = "ticket.completed";
    pub const TICKET_FAILED: &str = "ticket.failed";

    pub const PHASE_TRANSITIONED: &str = "phase.transitioned";
    pub const PHASE_AMBIGUOUS: &str = "phase.ambiguous";

    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    pub const AGENT_STALE: &str = "agent.stale";
    pub const AGENT_TERMINATED: &str = "agent.terminated";

    pub const DISCOVERY_RECORDED: &str = "discovery.recorded";
    pub const DIAGNOSTIC_STUCK_DETECTED: &str = "diagnostic.stuck_detected";

    pub const GUARDIAN_INTERVENTION_STARTED: &str = "guardian.intervention.started";
    pub const GUARDIAN_INTERVENTION_COMPLETED: &str = "guardian.intervention.completed";
    pub const GUARDIAN_INTERVENTION_REVERTED: &str = "guardian.intervention.reverted";

    pub const WORKFLOW_RESULT_SUBMITTED: &str = "workflow.result.submitted";
    pub const WORKFLOW_RESULT_VALIDATED: &str = "workflow.result.validated";
    pub const WORKFLOW_RESULT_REJECTED: &str = "workflow.result.rejected";
}

/// Whether events on this topic are additionally appended to the store's
/// event table in the transaction that produced them, so the audit trail
/// can be reconstructed from the store alone.
pub fn is_durable(event_type: &str) -> bool {
    event_type == topics::TASK_COMPLETED
        || event_type == topics::PHASE_TRANSITIONED
        || event_type.starts_with("guardian.")
        || event_type.starts_with("workflow.result.")
}

/// Serialize a payload struct to the JSON value carried on the wire.
///
/// Payload shapes are plain data and cannot fail to serialize; if one ever
/// does, the event goes out with a null payload rather than aborting the
/// operation that produced it.
pub fn payload_value<T: serde::Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize event payload");
        serde_json::Value::Null
    })
}

/// An event as carried by the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: Uuid,
        payload: serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.to_owned(),
            entity_type: entity_type.to_owned(),
            entity_id,
            payload,
            recorded_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// Payload for `task.*` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEventPayload {
    pub schema_version: u32,
    pub ticket_id: Uuid,
    pub phase_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    /// Set on `task.failed`: whether the failure was classified retryable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Payload for `phase.transitioned` and `phase.ambiguous`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseEventPayload {
    pub schema_version: u32,
    pub ticket_id: Uuid,
    pub from_phase: Option<String>,
    pub to_phase: Option<String>,
    pub reason: String,
}

/// Payload for `agent.*` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEventPayload {
    pub schema_version: u32,
    pub agent_type: String,
    pub status: String,
}

/// Payload for `discovery.recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryEventPayload {
    pub schema_version: u32,
    pub source_task_id: Uuid,
    pub spawned_task_id: Uuid,
    pub discovery_type: String,
}

/// One task's outcome in a stuck-detection evidence list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: String,
}

/// Payload for `diagnostic.stuck_detected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StuckDetectedPayload {
    pub schema_version: u32,
    pub ticket_id: Uuid,
    pub phase_id: Option<String>,
    pub evidence: Vec<TaskOutcome>,
}

/// Payload for `guardian.intervention.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardianEventPayload {
    pub schema_version: u32,
    pub action_id: Uuid,
    pub action_type: String,
    pub target_entity_id: Uuid,
    pub initiated_by: String,
}

/// Payload for `workflow.result.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowResultPayload {
    pub schema_version: u32,
    pub ticket_id: Uuid,
    pub submission_id: Uuid,
    pub phase_id: String,
    pub artifact_kind: String,
}

// ---------------------------------------------------------------------------
// Task result envelope
// ---------------------------------------------------------------------------

/// The versioned shape of a task result blob as submitted by an agent.
///
/// The interior `data` stays opaque to the engine; everything the engine
/// itself reads (category for retry classification, `next_phase` for
/// successor nomination) is an explicit field. Unknown top-level fields are
/// rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResultEnvelope {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Nominated successor phase when the current phase allows several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<String>,
    /// Agent-supplied failure category, consulted on `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TaskResultEnvelope {
    /// Parse and validate a submitted result blob.
    pub fn parse(value: &serde_json::Value) -> EngineResult<Self> {
        let envelope: Self = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::validation(format!("malformed task result: {e}")))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(EngineError::validation(format!(
                "unsupported task result schema version {}",
                envelope.schema_version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_subset() {
        assert!(is_durable(topics::TASK_COMPLETED));
        assert!(is_durable(topics::PHASE_TRANSITIONED));
        assert!(is_durable(topics::GUARDIAN_INTERVENTION_STARTED));
        assert!(is_durable(topics::GUARDIAN_INTERVENTION_COMPLETED));
        assert!(is_durable(topics::GUARDIAN_INTERVENTION_REVERTED));
        assert!(is_durable(topics::WORKFLOW_RESULT_SUBMITTED));
        assert!(is_durable(topics::WORKFLOW_RESULT_VALIDATED));
        assert!(is_durable(topics::WORKFLOW_RESULT_REJECTED));

        assert!(!is_durable(topics::TASK_CREATED));
        assert!(!is_durable(topics::TASK_ASSIGNED));
        assert!(!is_durable(topics::AGENT_HEARTBEAT));
        assert!(!is_durable(topics::DISCOVERY_RECORDED));
    }

    #[test]
    fn result_envelope_roundtrip() {
        let value = serde_json::json!({
            "schema_version": 1,
            "summary": "implemented the parser",
            "artifacts": ["src/parser.rs"],
            "data": {"lines_changed": 120}
        });
        let envelope = TaskResultEnvelope::parse(&value).unwrap();
        assert_eq!(envelope.summary.as_deref(), Some("implemented the parser"));
        assert_eq!(envelope.artifacts, vec!["src/parser.rs"]);
    }

    #[test]
    fn result_envelope_rejects_unknown_fields() {
        let value = serde_json::json!({
            "schema_version": 1,
            "sumary": "typo field"
        });
        let result = TaskResultEnvelope::parse(&value);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn result_envelope_rejects_wrong_version() {
        let value = serde_json::json!({"schema_version": 2});
        let result = TaskResultEnvelope::parse(&value);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
