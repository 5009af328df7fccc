use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority of a ticket or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// The next priority level up. `Critical` saturates.
    pub fn boosted(self) -> Self {
        match self {
            Self::Critical | Self::High => Self::Critical,
            Self::Medium => Self::High,
            Self::Low => Self::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TicketStatus {
    /// Terminal ticket statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = TicketStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TicketStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketStatus`] string.
#[derive(Debug, Clone)]
pub struct TicketStatusParseError(pub String);

impl fmt::Display for TicketStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket status: {:?}", self.0)
    }
}

impl std::error::Error for TicketStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `blocked` marks a task whose dependency set references a failed or
/// cancelled task; it is never eligible for assignment until requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Assigned,
    Running,
    UnderReview,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Terminal task statuses admit no further transitions.
    ///
    /// `timed_out` is not terminal: the timeout sweep immediately routes it
    /// back to `pending` (retry) or on to `failed` (budget exhausted).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses during which a task counts against its agent's load.
    pub fn holds_agent(self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::UnderReview)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::UnderReview => "under_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "under_review" => Ok(Self::UnderReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Worker,
    Monitor,
    Watchdog,
    Guardian,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Monitor => "monitor",
            Self::Watchdog => "watchdog",
            Self::Guardian => "guardian",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = AgentTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "monitor" => Ok(Self::Monitor),
            "watchdog" => Ok(Self::Watchdog),
            "guardian" => Ok(Self::Guardian),
            other => Err(AgentTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentType`] string.
#[derive(Debug, Clone)]
pub struct AgentTypeParseError(pub String);

impl fmt::Display for AgentTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent type: {:?}", self.0)
    }
}

impl std::error::Error for AgentTypeParseError {}

// ---------------------------------------------------------------------------

/// Health/availability status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Degraded,
    Failed,
    Terminated,
}

impl AgentStatus {
    /// Whether an agent in this status may receive new assignments.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of discovery reported by an agent mid-task.
///
/// The `diagnostic_*` kinds are raised by the engine's own sweeps; they are
/// semantically identical to agent-reported kinds and exist as an audit
/// distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    Bug,
    Optimization,
    Clarification,
    DiagnosticStuck,
    DiagnosticNoResult,
}

impl DiscoveryType {
    pub fn is_diagnostic(self) -> bool {
        matches!(self, Self::DiagnosticStuck | Self::DiagnosticNoResult)
    }
}

impl fmt::Display for DiscoveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bug => "bug",
            Self::Optimization => "optimization",
            Self::Clarification => "clarification",
            Self::DiagnosticStuck => "diagnostic_stuck",
            Self::DiagnosticNoResult => "diagnostic_no_result",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryType {
    type Err = DiscoveryTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug" => Ok(Self::Bug),
            "optimization" => Ok(Self::Optimization),
            "clarification" => Ok(Self::Clarification),
            "diagnostic_stuck" => Ok(Self::DiagnosticStuck),
            "diagnostic_no_result" => Ok(Self::DiagnosticNoResult),
            other => Err(DiscoveryTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DiscoveryType`] string.
#[derive(Debug, Clone)]
pub struct DiscoveryTypeParseError(pub String);

impl fmt::Display for DiscoveryTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid discovery type: {:?}", self.0)
    }
}

impl std::error::Error for DiscoveryTypeParseError {}

// ---------------------------------------------------------------------------

/// Kind of guardian intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GuardianActionType {
    CancelTask,
    ReallocateCapacity,
    OverridePriority,
}

impl fmt::Display for GuardianActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CancelTask => "cancel_task",
            Self::ReallocateCapacity => "reallocate_capacity",
            Self::OverridePriority => "override_priority",
        };
        f.write_str(s)
    }
}

impl FromStr for GuardianActionType {
    type Err = GuardianActionTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel_task" => Ok(Self::CancelTask),
            "reallocate_capacity" => Ok(Self::ReallocateCapacity),
            "override_priority" => Ok(Self::OverridePriority),
            other => Err(GuardianActionTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GuardianActionType`] string.
#[derive(Debug, Clone)]
pub struct GuardianActionTypeParseError(pub String);

impl fmt::Display for GuardianActionTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid guardian action type: {:?}", self.0)
    }
}

impl std::error::Error for GuardianActionTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a workflow result submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    Validated,
    Rejected,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for SubmissionStatus {
    type Err = SubmissionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "validated" => Ok(Self::Validated),
            "rejected" => Ok(Self::Rejected),
            other => Err(SubmissionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubmissionStatus`] string.
#[derive(Debug, Clone)]
pub struct SubmissionStatusParseError(pub String);

impl fmt::Display for SubmissionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid submission status: {:?}", self.0)
    }
}

impl std::error::Error for SubmissionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow phase -- configuration data, not per-ticket state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Phase {
    pub id: String,
    pub display_name: String,
    pub sequence_order: i32,
    pub allowed_transitions: Vec<String>,
    pub is_terminal: bool,
    pub requires_review: bool,
    pub done_definitions: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub initial_prompt: String,
    pub next_steps: String,
    pub created_at: DateTime<Utc>,
}

/// A ticket -- the user-facing unit of work, tracked through phases.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub phase_id: Option<String>,
    pub status: TicketStatus,
    pub priority: Priority,
    pub blocked_by_ticket_ids: Vec<Uuid>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- a single schedulable operation within a ticket and phase.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub dependencies: Json<Vec<Uuid>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub sandbox_id: Option<String>,
    pub version: i64,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub phase_id: Option<String>,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub capacity: i32,
    pub current_load: i32,
    pub authority_level: i32,
    pub version: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A discovery made by an agent mid-task, paired with its branched task.
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Discovery {
    pub id: Uuid,
    pub source_task_id: Uuid,
    pub discovery_type: DiscoveryType,
    pub description: String,
    pub spawn_phase_id: String,
    pub spawn_task_id: Uuid,
    pub priority_boost: bool,
    pub created_at: DateTime<Utc>,
}

/// An authority-gated guardian intervention. Immutable except `reverted_at`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GuardianAction {
    pub id: Uuid,
    pub action_type: GuardianActionType,
    pub target_entity_id: Uuid,
    pub authority_level: i32,
    pub reason: String,
    pub initiated_by: String,
    pub approved_by: Option<String>,
    pub audit_log: serde_json::Value,
    pub executed_at: DateTime<Utc>,
    pub reverted_at: Option<DateTime<Utc>>,
}

/// A row in the durable event log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRow {
    pub id: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A workflow result submission handed to Result Intake.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowSubmission {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub artifact_kind: String,
    pub artifact_ref: String,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
}

/// A gate criterion marked satisfied by a validated submission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GateSatisfaction {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub criterion_index: i32,
    pub submission_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_display_roundtrip() {
        let variants = [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Priority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn priority_invalid() {
        let result = "urgent".parse::<Priority>();
        assert!(result.is_err());
    }

    #[test]
    fn priority_boost_saturates_at_critical() {
        assert_eq!(Priority::Low.boosted(), Priority::Medium);
        assert_eq!(Priority::Medium.boosted(), Priority::High);
        assert_eq!(Priority::High.boosted(), Priority::Critical);
        assert_eq!(Priority::Critical.boosted(), Priority::Critical);
    }

    #[test]
    fn ticket_status_display_roundtrip() {
        let variants = [
            TicketStatus::Pending,
            TicketStatus::InProgress,
            TicketStatus::Blocked,
            TicketStatus::Completed,
            TicketStatus::Failed,
            TicketStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TicketStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn ticket_status_terminal() {
        assert!(TicketStatus::Completed.is_terminal());
        assert!(TicketStatus::Failed.is_terminal());
        assert!(TicketStatus::Cancelled.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
        assert!(!TicketStatus::InProgress.is_terminal());
        assert!(!TicketStatus::Blocked.is_terminal());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::UnderReview,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::TimedOut,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "paused".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_terminal_and_load() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::TimedOut.is_terminal());
        assert!(!TaskStatus::UnderReview.is_terminal());

        assert!(TaskStatus::Assigned.holds_agent());
        assert!(TaskStatus::Running.holds_agent());
        assert!(TaskStatus::UnderReview.holds_agent());
        assert!(!TaskStatus::Pending.holds_agent());
        assert!(!TaskStatus::Completed.holds_agent());
        assert!(!TaskStatus::TimedOut.holds_agent());
    }

    #[test]
    fn agent_type_display_roundtrip() {
        let variants = [
            AgentType::Worker,
            AgentType::Monitor,
            AgentType::Watchdog,
            AgentType::Guardian,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Idle,
            AgentStatus::Busy,
            AgentStatus::Degraded,
            AgentStatus::Failed,
            AgentStatus::Terminated,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_schedulable() {
        assert!(AgentStatus::Idle.is_schedulable());
        assert!(AgentStatus::Busy.is_schedulable());
        assert!(!AgentStatus::Degraded.is_schedulable());
        assert!(!AgentStatus::Failed.is_schedulable());
        assert!(!AgentStatus::Terminated.is_schedulable());
    }

    #[test]
    fn discovery_type_display_roundtrip() {
        let variants = [
            DiscoveryType::Bug,
            DiscoveryType::Optimization,
            DiscoveryType::Clarification,
            DiscoveryType::DiagnosticStuck,
            DiscoveryType::DiagnosticNoResult,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: DiscoveryType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn discovery_type_diagnostic_flag() {
        assert!(DiscoveryType::DiagnosticStuck.is_diagnostic());
        assert!(DiscoveryType::DiagnosticNoResult.is_diagnostic());
        assert!(!DiscoveryType::Bug.is_diagnostic());
        assert!(!DiscoveryType::Clarification.is_diagnostic());
    }

    #[test]
    fn guardian_action_type_display_roundtrip() {
        let variants = [
            GuardianActionType::CancelTask,
            GuardianActionType::ReallocateCapacity,
            GuardianActionType::OverridePriority,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GuardianActionType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn guardian_action_type_invalid() {
        let result = "pause_task".parse::<GuardianActionType>();
        assert!(result.is_err());
    }

    #[test]
    fn submission_status_display_roundtrip() {
        let variants = [
            SubmissionStatus::Submitted,
            SubmissionStatus::Validated,
            SubmissionStatus::Rejected,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SubmissionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }
}
