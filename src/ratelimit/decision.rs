//! The result of a rate limit check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Whether an action may proceed, and when the caller's quota frees up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitDecision {
    pub allowed: bool,
    /// Further admissions permitted before `reset_at`
    pub remaining: u64,
    /// When the oldest counted event leaves the window. An upper bound under
    /// concurrent writers.
    pub reset_at: DateTime<Utc>,
    /// Set when the decision came from the failure policy, not the store
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl LimitDecision {
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Time the caller should wait, measured from `now`. Zero once `reset_at` has passed.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
