//! The engine's closed error taxonomy.
//!
//! Every operation on the command surface resolves to one of these kinds.
//! Retry decisions are driven by [`EngineError::is_retryable`], never by
//! inspecting error text or downcasting.

use uuid::Uuid;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the orchestration kernel.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The caller supplied bad input. Surfaced immediately.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The state machine rejected the requested transition.
    #[error("illegal transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    /// An agent tried to act on a task it does not hold. Treated as
    /// adversarial and never retried.
    #[error("task {task_id} is not held by agent {agent_id}")]
    WrongAgent { task_id: Uuid, agent_id: Uuid },

    /// Optimistic concurrency failure: the row changed under the reader.
    /// Retried internally a bounded number of times before surfacing.
    #[error("stale version on {entity} {id}: row changed concurrently")]
    StaleVersion { entity: &'static str, id: Uuid },

    /// Authority below the level the intervention requires.
    #[error("permission denied: required authority {required}, given {given}")]
    PermissionDenied { required: i32, given: i32 },

    /// Transient store or transport failure. Retryable.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// An engine invariant was violated; the process should not continue.
    #[error("engine invariant violated: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the failed operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::StaleVersion { .. })
    }
}
