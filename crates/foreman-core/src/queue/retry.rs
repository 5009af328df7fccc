//! Retry classification and back-off policy.
//!
//! Failures are split into retryable and permanent classes by an explicit
//! category string supplied with the failure, never by inspecting error
//! text. Unknown categories default to retryable.

use chrono::Duration;
use rand::Rng;

use crate::config::EngineConfig;

/// Whether a failed task goes back to the queue or stays failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Permanent,
}

/// Classify an agent-supplied failure category.
///
/// Permanent: authentication, permission, syntax errors in agent output,
/// and an explicit `fatal` classification. Everything else, including a
/// missing or unknown category, is retryable (transport errors, timeouts,
/// transient agent failures, stale versions).
pub fn classify_category(category: Option<&str>) -> Retryability {
    match category {
        Some("auth") | Some("authentication") | Some("permission") | Some("syntax")
        | Some("fatal") => Retryability::Permanent,
        _ => Retryability::Retryable,
    }
}

/// Exponential back-off with jitter for retry scheduling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_s: f64,
    cap_s: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_s: config.retry_base_s,
            cap_s: config.retry_cap_s,
            jitter: config.retry_jitter,
        }
    }

    /// The back-off delay before attempt `retry_count` re-enters the queue:
    /// `base * 2^retry_count`, capped, with uniform jitter.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exp = self.base_s * 2f64.powi(retry_count.max(0));
        let capped = exp.min(self.cap_s);
        let jitter_factor = if self.jitter > 0.0 {
            1.0 + rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let delayed_ms = (capped * jitter_factor * 1000.0).round().max(0.0) as i64;
        Duration::milliseconds(delayed_ms)
    }

    /// The inclusive bounds the jittered delay falls in, in seconds.
    pub fn backoff_bounds(&self, retry_count: i32) -> (f64, f64) {
        let capped = (self.base_s * 2f64.powi(retry_count.max(0))).min(self.cap_s);
        (capped * (1.0 - self.jitter), capped * (1.0 + self.jitter))
    }
}
