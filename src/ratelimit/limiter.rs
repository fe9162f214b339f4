//! Sliding window limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::{window_millis, BackendKind, WindowCount, WindowStore};
use super::clock::Clock;
use super::decision::LimitDecision;
use crate::error::{FormGuardError, Result};

/// Which checks consume quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountingMode {
    /// Every check is recorded, denied ones included. A caller that keeps
    /// hammering stays locked out until it backs off. Stores keep at most
    /// `max_events + 1` attempts per identifier, so hammering does not grow
    /// memory.
    #[default]
    Attempts,
    /// Only admitted checks are recorded.
    Admissions,
}

/// A validated limit: at most `max_events` per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    max_events: u64,
    window: Duration,
}

impl Quota {
    /// Build a quota, rejecting a zero limit or a window shorter than a millisecond.
    pub fn new(max_events: u64, window: Duration) -> Result<Self> {
        if max_events == 0 {
            return Err(FormGuardError::Configuration(
                "max_events must be greater than zero".to_string(),
            ));
        }
        if window_millis(window) == 0 {
            return Err(FormGuardError::Configuration(
                "window must be at least one millisecond".to_string(),
            ));
        }
        Ok(Self { max_events, window })
    }

    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Decides admit or deny from the events a `WindowStore` holds for an identifier.
///
/// The limiter owns no state of its own; it is safe to share across tasks.
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    quota: Quota,
    counting: CountingMode,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
        quota: Quota,
        counting: CountingMode,
    ) -> Self {
        Self {
            store,
            clock,
            quota,
            counting,
        }
    }

    /// The quota used by `check_default`.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn counting(&self) -> CountingMode {
        self.counting
    }

    pub fn backend(&self) -> BackendKind {
        self.store.kind()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check against the configured quota.
    pub async fn check_default(&self, identifier: &str) -> Result<LimitDecision> {
        self.check(identifier, self.quota).await
    }

    /// Record a check for `identifier` and decide it.
    ///
    /// The event that would take the count past `max_events` is the one
    /// denied; older admitted events are never displaced.
    pub async fn check(&self, identifier: &str, quota: Quota) -> Result<LimitDecision> {
        let now = self.clock.now_millis();

        trace!(
            identifier = %identifier,
            max_events = quota.max_events,
            window_ms = window_millis(quota.window),
            "Checking sliding window"
        );

        let counted = match self.counting {
            CountingMode::Attempts => {
                self.store
                    .record_and_count(identifier, now, quota.window, quota.max_events)
                    .await?
            }
            CountingMode::Admissions => {
                self.store
                    .record_if_below(identifier, now, quota.window, quota.max_events)
                    .await?
            }
        };

        let allowed = match self.counting {
            CountingMode::Attempts => counted.count <= quota.max_events,
            CountingMode::Admissions => counted.recorded,
        };

        let decision = LimitDecision {
            allowed,
            remaining: if allowed {
                quota.max_events.saturating_sub(counted.count)
            } else {
                0
            },
            reset_at: reset_at(&counted, now, quota.window),
            degraded: false,
        };

        if !allowed {
            debug!(
                identifier = %identifier,
                count = counted.count,
                max_events = quota.max_events,
                "Sliding window limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Describe where `identifier` stands without consuming quota.
    ///
    /// `allowed` reports whether the next check would be admitted.
    pub async fn peek(&self, identifier: &str, quota: Quota) -> Result<LimitDecision> {
        let now = self.clock.now_millis();
        let counted = self
            .store
            .peek(identifier, now, quota.window, quota.max_events)
            .await?;

        Ok(LimitDecision {
            allowed: counted.count < quota.max_events,
            remaining: quota.max_events.saturating_sub(counted.count),
            reset_at: match counted.release {
                Some(_) => reset_at(&counted, now, quota.window),
                None => millis_to_datetime(now),
            },
            degraded: false,
        })
    }
}

/// First instant at which the next check would be admitted: one millisecond
/// after the releasing event leaves the window. Falls back to a full window
/// from `now` when the store reports no events.
fn reset_at(counted: &WindowCount, now: i64, window: Duration) -> DateTime<Utc> {
    expiry_of(counted.release.unwrap_or(now), window)
}

/// First instant at which an event stamped `ts` no longer counts.
pub(crate) fn expiry_of(ts: i64, window: Duration) -> DateTime<Utc> {
    millis_to_datetime(ts.saturating_add(window_millis(window)).saturating_add(1))
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
