//! Task state machine transitions.
//!
//! Validates the allowed transition graph before any row is touched;
//! optimistic locking in the store enforces it under concurrency.

use foreman_db::models::{Task, TaskStatus};
use uuid::Uuid;

use crate::error::EngineError;

/// The task state machine.
///
/// The transition graph:
///
/// ```text
/// pending      -> assigned | blocked | cancelled
/// blocked      -> pending | cancelled
/// assigned     -> running | pending (retry) | timed_out | failed | cancelled
/// running      -> under_review | completed | pending (retry) | failed | timed_out | cancelled
/// under_review -> completed (approve) | running (reject) | cancelled
/// timed_out    -> pending (retry) | failed | cancelled
/// ```
///
/// `completed`, `failed`, and `cancelled` are terminal.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Assigned)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Assigned, Running)
                | (Assigned, Pending)
                | (Assigned, TimedOut)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Running, UnderReview)
                | (Running, Completed)
                | (Running, Pending)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (UnderReview, Completed)
                | (UnderReview, Running)
                | (UnderReview, Cancelled)
                | (TimedOut, Pending)
                | (TimedOut, Failed)
                | (TimedOut, Cancelled)
        )
    }

    /// Reject the transition with [`EngineError::IllegalTransition`] when it
    /// is not an edge in the graph.
    pub fn ensure(task: &Task, to: TaskStatus) -> Result<(), EngineError> {
        Self::ensure_from(task.id, task.status, to)
    }

    pub fn ensure_from(id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<(), EngineError> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                entity: "task",
                id,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}
