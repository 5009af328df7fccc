//! The queue's priority score model.
//!
//! Within the queue, ordering is by a continuous score rather than priority
//! class alone: `score = w_p * P + w_a * min(age / age_ceiling, 1)`. Old
//! low-priority tasks eventually overtake fresh medium ones, so no task
//! starves, while urgent work still jumps the line. The assignment query
//! evaluates the same formula in SQL; this module is the reference
//! implementation the tests pin down.

use chrono::Duration;

use foreman_db::models::Priority;

/// Parameters of the score formula.
#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    pub w_p: f64,
    pub w_a: f64,
    pub age_ceiling_s: f64,
}

/// The priority term `P` of the score formula.
pub fn priority_weight(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 1.0,
        Priority::High => 0.7,
        Priority::Medium => 0.4,
        Priority::Low => 0.1,
    }
}

/// Compute the age-weighted score for a task of the given priority and age.
pub fn score(priority: Priority, age: Duration, params: &ScoreParams) -> f64 {
    let age_s = (age.num_milliseconds() as f64 / 1000.0).max(0.0);
    let age_term = (age_s / params.age_ceiling_s).min(1.0);
    params.w_p * priority_weight(priority) + params.w_a * age_term
}
