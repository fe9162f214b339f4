//! In-process window store.
//!
//! Each identifier maps to its event timestamps in ascending order. The map is
//! sharded by `DashMap`, so checks on different identifiers rarely contend
//! while checks on the same identifier serialize on its entry lock. Nothing
//! under a lock touches I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{
    release_offset, window_floor, BackendKind, RetentionBounds, WindowCount, WindowStore,
};
use crate::error::Result;

/// Window store kept in process memory.
///
/// Stale identifiers are dropped when next touched, and every `sweep_every`
/// mutating calls a full pass reclaims identifiers that were never touched
/// again. There is no background thread.
pub struct LocalWindowStore {
    windows: DashMap<String, VecDeque<i64>>,
    /// Mutating calls between full sweeps, 0 disables
    sweep_every: u64,
    ops: AtomicU64,
    bounds: RetentionBounds,
}

impl LocalWindowStore {
    /// Create a store that sweeps every `sweep_every` mutating calls.
    pub fn new(sweep_every: u64) -> Self {
        Self {
            windows: DashMap::new(),
            sweep_every,
            ops: AtomicU64::new(0),
            bounds: RetentionBounds::default(),
        }
    }

    /// Number of identifiers currently holding state.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop every event older than the widest window seen, and every
    /// identifier left without events. Returns the number of identifiers removed.
    pub fn sweep(&self, now: i64) -> usize {
        let floor = now.saturating_sub(self.bounds.widest_window_ms());
        let before = self.windows.len();
        self.windows.retain(|_, events| {
            prune(events, floor);
            !events.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        debug!(
            removed = removed,
            remaining = self.windows.len(),
            "Swept local window store"
        );
        removed
    }

    fn record(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
        conditional: bool,
    ) -> WindowCount {
        let (retain_ms, cap) = self.bounds.observe(window, max_events);
        let floor = window_floor(now, window);

        let (result, drained) = {
            let mut entry = self.windows.entry(identifier.to_string()).or_default();
            let events = entry.value_mut();
            prune(events, now.saturating_sub(retain_ms));

            let in_window = count_since(events, floor);
            let recorded = !conditional || in_window < max_events;
            if recorded {
                insert_ordered(events, now);
                truncate_front(events, cap);
            }

            (summarize(events, floor, max_events, recorded), events.is_empty())
        };

        if drained {
            self.windows.remove_if(identifier, |_, events| events.is_empty());
        }

        trace!(
            identifier = %identifier,
            count = result.count,
            recorded = result.recorded,
            "Recorded local window event"
        );

        self.maybe_sweep(now);
        result
    }

    fn count(&self, identifier: &str, now: i64, window: Duration, max_events: u64) -> WindowCount {
        let (retain_ms, _) = self.bounds.observe(window, max_events);
        let floor = window_floor(now, window);

        let (result, drained) = match self.windows.get_mut(identifier) {
            Some(mut events) => {
                prune(&mut events, now.saturating_sub(retain_ms));
                (summarize(&events, floor, max_events, false), events.is_empty())
            }
            None => (WindowCount::empty(), false),
        };

        if drained {
            self.windows.remove_if(identifier, |_, events| events.is_empty());
        }
        result
    }

    fn maybe_sweep(&self, now: i64) {
        if self.sweep_every == 0 {
            return;
        }
        let ops = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % self.sweep_every == 0 {
            self.sweep(now);
        }
    }

    #[cfg(test)]
    fn retained(&self, identifier: &str) -> usize {
        self.windows.get(identifier).map_or(0, |events| events.len())
    }
}

impl Default for LocalWindowStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn record_and_count(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        Ok(self.record(identifier, now, window, max_events, false))
    }

    async fn record_if_below(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        Ok(self.record(identifier, now, window, max_events, true))
    }

    async fn peek(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        Ok(self.count(identifier, now, window, max_events))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

/// Remove events older than `floor` from the front of an ordered window.
fn prune(events: &mut VecDeque<i64>, floor: i64) {
    while events.front().is_some_and(|&ts| ts < floor) {
        events.pop_front();
    }
}

/// Keep only the newest `cap` events.
fn truncate_front(events: &mut VecDeque<i64>, cap: u64) {
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    let excess = events.len().saturating_sub(cap);
    events.drain(..excess);
}

fn count_since(events: &VecDeque<i64>, floor: i64) -> u64 {
    (events.len() - events.partition_point(|&ts| ts < floor)) as u64
}

fn summarize(
    events: &VecDeque<i64>,
    floor: i64,
    max_events: u64,
    recorded: bool,
) -> WindowCount {
    let start = events.partition_point(|&ts| ts < floor);
    let count = (events.len() - start) as u64;
    let offset = usize::try_from(release_offset(count, max_events)).unwrap_or(usize::MAX);
    WindowCount {
        count,
        oldest: events.get(start).copied(),
        release: events.get(start.saturating_add(offset)).copied(),
        recorded,
    }
}

/// Insert keeping ascending order; a clock that steps backwards lands mid-queue.
fn insert_ordered(events: &mut VecDeque<i64>, ts: i64) {
    match events.back() {
        Some(&last) if last > ts => {
            let at = events.partition_point(|&existing| existing <= ts);
            events.insert(at, ts);
        }
        _ => events.push_back(ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    const WINDOW: Duration = Duration::from_secs(10);
    const MAX: u64 = 100;

    #[tokio::test]
    async fn test_record_and_count_accumulates() {
        let store = LocalWindowStore::default();

        let first = assert_ok!(store.record_and_count("x", 0, WINDOW, MAX).await);
        assert_eq!(first.count, 1);
        assert_eq!(first.oldest, Some(0));
        assert_eq!(first.release, Some(0));
        assert!(first.recorded);

        let second = assert_ok!(store.record_and_count("x", 1_000, WINDOW, MAX).await);
        assert_eq!(second.count, 2);
        assert_eq!(second.oldest, Some(0));
    }

    #[tokio::test]
    async fn test_events_leave_window_at_boundary() {
        let store = LocalWindowStore::default();
        store.record_and_count("x", 0, WINDOW, MAX).await.unwrap();
        store.record_and_count("x", 1_000, WINDOW, MAX).await.unwrap();

        let at_boundary = store.peek("x", 10_000, WINDOW, MAX).await.unwrap();
        assert_eq!(at_boundary.count, 2);

        let just_after = store.peek("x", 10_001, WINDOW, MAX).await.unwrap();
        assert_eq!(just_after.count, 1);
        assert_eq!(just_after.oldest, Some(1_000));
    }

    #[tokio::test]
    async fn test_peek_does_not_record() {
        let store = LocalWindowStore::default();
        let peeked = store.peek("x", 0, WINDOW, MAX).await.unwrap();
        assert_eq!(peeked, WindowCount::empty());
        assert!(store.is_empty());

        store.record_and_count("x", 0, WINDOW, MAX).await.unwrap();
        store.peek("x", 1, WINDOW, MAX).await.unwrap();
        assert_eq!(store.peek("x", 2, WINDOW, MAX).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_record_if_below_stops_at_limit() {
        let store = LocalWindowStore::default();
        for i in 0..3 {
            let result = store.record_if_below("x", i, WINDOW, 3).await.unwrap();
            assert!(result.recorded);
            assert_eq!(result.count, (i + 1) as u64);
        }

        let denied = store.record_if_below("x", 3, WINDOW, 3).await.unwrap();
        assert!(!denied.recorded);
        assert_eq!(denied.count, 3);
        assert_eq!(denied.oldest, Some(0));
        assert_eq!(denied.release, Some(0));
    }

    #[tokio::test]
    async fn test_release_points_past_excess_attempts() {
        let store = LocalWindowStore::default();
        for ts in [0, 1_000, 2_000, 3_000] {
            store.record_and_count("x", ts, WINDOW, 3).await.unwrap();
        }

        // Four in the window, limit three: the oldest two must both expire
        let result = store.peek("x", 3_000, WINDOW, 3).await.unwrap();
        assert_eq!(result.count, 4);
        assert_eq!(result.oldest, Some(0));
        assert_eq!(result.release, Some(1_000));
    }

    #[tokio::test]
    async fn test_repeated_attempts_keep_bounded_history() {
        let store = LocalWindowStore::new(0);
        for ts in 0..10_000 {
            let result = store.record_and_count("hammered", ts, WINDOW, 3).await.unwrap();
            assert!(result.count <= 4);
        }
        assert_eq!(store.retained("hammered"), 4);

        // The newest three decide when the next check can pass
        let result = store.peek("hammered", 9_999, WINDOW, 3).await.unwrap();
        assert_eq!(result.count, 4);
        assert_eq!(result.release, Some(9_997));
    }

    #[tokio::test]
    async fn test_short_window_keeps_events_for_longer_window() {
        let long = Duration::from_secs(60);
        let store = LocalWindowStore::default();
        assert!(store.record_if_below("x", 0, long, 2).await.unwrap().recorded);
        assert!(store.record_if_below("x", 1_000, long, 2).await.unwrap().recorded);

        let short = store.record_if_below("x", 20_000, WINDOW, 100).await.unwrap();
        assert!(short.recorded);
        assert_eq!(short.count, 1);

        let again = store.record_if_below("x", 21_000, long, 2).await.unwrap();
        assert!(!again.recorded);
        assert_eq!(again.count, 3);
        assert_eq!(again.oldest, Some(0));
    }

    #[tokio::test]
    async fn test_expired_identifier_is_dropped_on_touch() {
        let store = LocalWindowStore::new(0);
        store.record_and_count("x", 0, WINDOW, MAX).await.unwrap();
        assert_eq!(store.len(), 1);

        let later = store.peek("x", 20_000, WINDOW, MAX).await.unwrap();
        assert_eq!(later.count, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let store = LocalWindowStore::default();
        for i in 0..4 {
            store.record_and_count("a", i, WINDOW, MAX).await.unwrap();
        }
        let b = store.record_and_count("b", 5, WINDOW, MAX).await.unwrap();
        assert_eq!(b.count, 1);
        assert_eq!(store.peek("a", 5, WINDOW, MAX).await.unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_backwards_clock_keeps_order() {
        let store = LocalWindowStore::default();
        store.record_and_count("x", 5_000, WINDOW, MAX).await.unwrap();
        let result = store.record_and_count("x", 2_000, WINDOW, MAX).await.unwrap();
        assert_eq!(result.oldest, Some(2_000));

        let later = store.peek("x", 12_500, WINDOW, MAX).await.unwrap();
        assert_eq!(later.count, 1);
        assert_eq!(later.oldest, Some(5_000));
    }

    #[test]
    fn test_sweep_reclaims_untouched_identifiers() {
        let store = LocalWindowStore::new(0);
        for i in 0..1000 {
            store.record(&format!("id-{}", i), 0, WINDOW, MAX, false);
        }
        assert_eq!(store.len(), 1000);

        assert_eq!(store.sweep(10_000), 0);
        assert_eq!(store.sweep(10_001), 1000);
        assert!(store.is_empty());
    }

    #[test]
    fn test_amortized_sweep_runs_without_explicit_call() {
        let store = LocalWindowStore::new(10);
        for i in 0..9 {
            store.record(&format!("old-{}", i), 0, WINDOW, MAX, false);
        }
        assert_eq!(store.len(), 9);

        // Tenth mutating call triggers the sweep after everything has aged out
        store.record("fresh", 60_000, WINDOW, MAX, false);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweep_respects_widest_window() {
        let store = LocalWindowStore::new(0);
        store.record("long", 0, Duration::from_secs(60), MAX, false);
        store.record("short", 0, WINDOW, MAX, false);

        // Past the short window but inside the long one
        assert_eq!(store.sweep(30_000), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_identifier_is_linearized() {
        let store = Arc::new(LocalWindowStore::default());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_if_below("shared", 1_000, WINDOW, 5).await.unwrap()
            }));
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 5);
        assert_eq!(store.peek("shared", 1_000, WINDOW, 5).await.unwrap().count, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_are_not_lost() {
        let store = Arc::new(LocalWindowStore::default());
        let mut handles = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_and_count("shared", i, WINDOW, 200).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.peek("shared", 200, WINDOW, 200).await.unwrap().count, 200);
    }
}
