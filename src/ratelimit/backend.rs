//! Window store trait for abstracting local and remote event history.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Which kind of store is holding limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, limits are per instance
    Local,
    /// Shared store, limits hold across instances
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

/// Outcome of a single store round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Events inside the call's window after this operation. Never exceeds
    /// one more than the largest `max_events` the store has been asked about.
    pub count: u64,
    /// Timestamp (epoch ms) of the oldest event inside the window
    pub oldest: Option<i64>,
    /// Timestamp of the event whose expiry frees the next admission: the
    /// event at position `count - max_events` in the window, or the oldest
    /// one when the count is below the limit
    pub release: Option<i64>,
    /// Whether this operation appended an event
    pub recorded: bool,
}

impl WindowCount {
    pub fn empty() -> Self {
        Self {
            count: 0,
            oldest: None,
            release: None,
            recorded: false,
        }
    }
}

/// Per-identifier event history with expiry.
///
/// An event stamped `t` counts toward a window while `t >= now - window`, so
/// it still counts at `t + window` and is gone one millisecond later. Stores
/// keep events for the widest window they have been asked about, so a short
/// window on one call never evicts events a longer window still counts. They
/// also keep at most one event more than the largest `max_events` seen per
/// identifier: older events cannot change any decision.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Append an event at `now`, prune, and count in one atomic step.
    async fn record_and_count(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount>;

    /// Like `record_and_count`, but only appends while fewer than
    /// `max_events` events are inside the window.
    async fn record_if_below(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount>;

    /// Prune and count without appending.
    async fn peek(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount>;

    fn kind(&self) -> BackendKind;
}

/// Window length in milliseconds, clamped to what epoch-ms arithmetic can hold.
pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Earliest timestamp still inside the window ending at `now`.
pub(crate) fn window_floor(now: i64, window: Duration) -> i64 {
    now.saturating_sub(window_millis(window))
}

/// Widest window and largest limit a store has been asked about.
///
/// Both only grow. Retention follows them so every quota used against a store
/// still sees the events it counts.
#[derive(Debug, Default)]
pub(crate) struct RetentionBounds {
    widest_window_ms: AtomicI64,
    largest_max: AtomicU64,
}

impl RetentionBounds {
    /// Fold in one call's quota and return `(retain_ms, cap)`: how long events
    /// must be kept and how many per identifier.
    pub(crate) fn observe(&self, window: Duration, max_events: u64) -> (i64, u64) {
        let window_ms = window_millis(window);
        let widest = self
            .widest_window_ms
            .fetch_max(window_ms, Ordering::Relaxed)
            .max(window_ms);
        let largest = self
            .largest_max
            .fetch_max(max_events, Ordering::Relaxed)
            .max(max_events);
        (widest, largest.saturating_add(1))
    }

    pub(crate) fn widest_window_ms(&self) -> i64 {
        self.widest_window_ms.load(Ordering::Relaxed)
    }
}

/// Index, counted from the oldest in-window event, of the event whose expiry
/// frees the next admission.
pub(crate) fn release_offset(count: u64, max_events: u64) -> u64 {
    count.saturating_sub(max_events)
}
