//! Bounded hand-off between a push backend's notification thread and the
//! listener worker. Pushing never blocks; on overflow the oldest buffered
//! creation notice is discarded first, since exits are what drive cleanup.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEventKind {
    Created {
        parent_pid: Option<u32>,
        name: String,
    },
    Deleted {
        /// Terminated by a signal rather than exiting on its own.
        killed: bool,
    },
}

/// A raw notification as delivered by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEvent {
    pub pid: u32,
    pub kind: NativeEventKind,
    pub observed_at: DateTime<Utc>,
}

impl NativeEvent {
    pub fn created(pid: u32, parent_pid: Option<u32>, name: impl Into<String>) -> Self {
        Self {
            pid,
            kind: NativeEventKind::Created {
                parent_pid,
                name: name.into(),
            },
            observed_at: Utc::now(),
        }
    }

    pub fn deleted(pid: u32, killed: bool) -> Self {
        Self {
            pid,
            kind: NativeEventKind::Deleted { killed },
            observed_at: Utc::now(),
        }
    }

    fn is_low_priority(&self) -> bool {
        matches!(self.kind, NativeEventKind::Created { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding an older entry.
    DroppedOldest,
    Closed,
}

#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    items: Mutex<VecDeque<NativeEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: NativeEvent) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut items = self.items.lock();
            let outcome = if items.len() >= self.capacity {
                let victim = items
                    .iter()
                    .position(NativeEvent::is_low_priority)
                    .unwrap_or(0);
                items.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            items.push_back(event);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<NativeEvent> {
        loop {
            if let Some(event) = self.items.lock().pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
