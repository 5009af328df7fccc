//! Engine configuration.
//!
//! A single flat object covering the orchestrator tick, sweep cadences,
//! staleness thresholds, queue scoring weights, retry policy, the store
//! deadline, and the guardian authority floor. Every field has the
//! documented default; an `[engine]` section in the CLI config file
//! overrides fields individually.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use foreman_db::queries::tasks::CandidateParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Orchestrator tick period in milliseconds.
    pub tick_period_ms: u64,
    /// Heartbeat sweep period in seconds.
    pub heartbeat_sweep_period_s: u64,
    /// Task timeout sweep period in seconds.
    pub task_timeout_sweep_period_s: u64,
    /// Stuck-workflow sweep period in seconds.
    pub stuck_sweep_period_s: u64,
    /// Heartbeat age beyond which an agent is stale, in seconds (strict).
    pub heartbeat_stale_s: i64,
    /// Quiet time after the last task activity before a ticket counts as
    /// stuck, in seconds.
    pub stuck_threshold_s: i64,
    /// Minimum gap between stuck detections for the same ticket, in seconds.
    pub stuck_cooldown_s: i64,
    /// Priority weight in the queue score. `queue_w_p + queue_w_a = 1`.
    pub queue_w_p: f64,
    /// Age weight in the queue score.
    pub queue_w_a: f64,
    /// Age at which the score's age term saturates, in seconds.
    pub queue_age_ceiling_s: i64,
    /// Base retry back-off delay in seconds.
    pub retry_base_s: f64,
    /// Retry back-off cap in seconds.
    pub retry_cap_s: f64,
    /// Uniform jitter applied to the back-off delay (fraction, +/-).
    pub retry_jitter: f64,
    /// Default retry budget for new tasks.
    pub default_max_retries: i32,
    /// Deadline for store operations in seconds.
    pub store_deadline_s: u64,
    /// Minimum authority level for guardian interventions.
    pub guardian_min_authority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 250,
            heartbeat_sweep_period_s: 10,
            task_timeout_sweep_period_s: 10,
            stuck_sweep_period_s: 60,
            heartbeat_stale_s: 90,
            stuck_threshold_s: 60,
            stuck_cooldown_s: 60,
            queue_w_p: 0.45,
            queue_w_a: 0.55,
            queue_age_ceiling_s: 3600,
            retry_base_s: 1.0,
            retry_cap_s: 60.0,
            retry_jitter: 0.25,
            default_max_retries: 3,
            store_deadline_s: 5,
            guardian_min_authority: 4,
        }
    }
}

impl EngineConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn heartbeat_sweep_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_period_s)
    }

    pub fn task_timeout_sweep_period(&self) -> Duration {
        Duration::from_secs(self.task_timeout_sweep_period_s)
    }

    pub fn stuck_sweep_period(&self) -> Duration {
        Duration::from_secs(self.stuck_sweep_period_s)
    }

    pub fn store_deadline(&self) -> Duration {
        Duration::from_secs(self.store_deadline_s)
    }

    /// Score parameters for the assignment candidate query.
    pub fn candidate_params(&self) -> CandidateParams {
        CandidateParams {
            w_p: self.queue_w_p,
            w_a: self.queue_w_a,
            age_ceiling_s: self.queue_age_ceiling_s as f64,
        }
    }
}
