//! Short-lived cache of uniqueness keys.
//!
//! An event is a duplicate when an event with the same key, or the same
//! logical event in an adjacent time bucket, was accepted less than one
//! window earlier or later. Each bucket therefore holds at most one
//! accepted event and accepted events for the same pid and kind are at
//! least one window apart.

use crate::core::models::{time_bucket, MonitoringEvent, UniquenessKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const PRUNE_EVERY: u64 = 256;

#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    seen: DashMap<UniquenessKey, DateTime<Utc>>,
    latest: parking_lot::Mutex<Option<DateTime<Utc>>>,
    inserts: AtomicU64,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            seen: DashMap::new(),
            latest: parking_lot::Mutex::new(None),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record `event` and return `true` if it is the first of its kind in
    /// the window, `false` if it should be merged into an earlier one.
    pub fn check_and_insert(&self, event: &MonitoringEvent) -> bool {
        let window_ms = self.window.as_millis() as i64;
        let bucket = time_bucket(event.timestamp, self.window);

        let neighbours = [
            UniquenessKey::compute(event.pid, event.kind, bucket - 1),
            UniquenessKey::compute(event.pid, event.kind, bucket + 1),
        ];
        for key in neighbours {
            if let Some(seen_at) = self.seen.get(&key) {
                if (event.timestamp - *seen_at).num_milliseconds().abs() < window_ms {
                    return false;
                }
            }
        }

        match self.seen.entry(event.key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event.timestamp);
            }
        }

        self.note_latest(event.timestamp);
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }
        true
    }

    /// Forget keys older than two windows before the newest accepted event.
    pub fn prune(&self) {
        let Some(latest) = *self.latest.lock() else {
            return;
        };
        let horizon_ms = (self.window.as_millis() as i64).saturating_mul(2);
        self.seen
            .retain(|_, seen_at| (latest - *seen_at).num_milliseconds() < horizon_ms);
    }

    fn note_latest(&self, timestamp: DateTime<Utc>) {
        let mut latest = self.latest.lock();
        if latest.map_or(true, |current| timestamp > current) {
            *latest = Some(timestamp);
        }
    }
}
