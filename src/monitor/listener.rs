//! Push-based process notifications.
//!
//! A backend delivers native notifications through a [`ListenerSink`] into
//! a bounded queue. A dedicated worker drains the queue, converts entries
//! to [`MonitoringEvent`]s, drops duplicates and forwards the rest to the
//! monitor.

use crate::core::models::{EventKind, EventSource, MonitoringEvent, ProcessRecord, ProcessState};
use crate::error::ListenerError;
use crate::monitor::backend::EventBackend;
use crate::monitor::dedup::DedupCache;
use crate::monitor::queue::{EventQueue, NativeEvent, NativeEventKind, PushOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ListenerMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl ListenerMetrics {
    fn beat(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.lock().map(|at| at.elapsed())
    }

    pub fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub received: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    /// Discarded because the queue was full.
    pub dropped: u64,
}

/// Callback surface handed to a backend. Both callbacks return immediately.
#[derive(Debug, Clone)]
pub struct ListenerSink {
    queue: Arc<EventQueue>,
    metrics: Arc<ListenerMetrics>,
}

impl ListenerSink {
    pub fn new(queue: Arc<EventQueue>, metrics: Arc<ListenerMetrics>) -> Self {
        Self { queue, metrics }
    }

    pub fn on_process_created(&self, pid: u32, parent_pid: Option<u32>, name: &str) {
        self.enqueue(NativeEvent::created(pid, parent_pid, name));
    }

    pub fn on_process_deleted(&self, pid: u32, killed: bool) {
        self.enqueue(NativeEvent::deleted(pid, killed));
    }

    fn enqueue(&self, event: NativeEvent) {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(event) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {
                debug!("push notification arrived after listener stopped");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub dedup_window: Duration,
    pub queue_capacity: usize,
    /// How often an idle worker proves it is still alive.
    pub heartbeat_interval: Duration,
}

pub struct EventListener {
    backend: Arc<dyn EventBackend>,
    settings: ListenerSettings,
    queue: Arc<EventQueue>,
    dedup: Arc<DedupCache>,
    metrics: Arc<ListenerMetrics>,
    output: mpsc::UnboundedSender<MonitoringEvent>,
    listening: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventListener {
    pub fn new(
        backend: Arc<dyn EventBackend>,
        settings: ListenerSettings,
        output: mpsc::UnboundedSender<MonitoringEvent>,
    ) -> Self {
        Self {
            queue: Arc::new(EventQueue::new(settings.queue_capacity)),
            dedup: Arc::new(DedupCache::new(settings.dedup_window)),
            metrics: Arc::new(ListenerMetrics::default()),
            backend,
            settings,
            output,
            listening: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<ListenerMetrics> {
        &self.metrics
    }

    /// Subscribe to the backend and start the worker. Must be called from
    /// within a tokio runtime.
    pub fn start_listening(&self) -> Result<(), ListenerError> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyListening);
        }

        self.queue.reopen();
        let sink = ListenerSink::new(self.queue.clone(), self.metrics.clone());
        if let Err(err) = self.backend.subscribe(sink) {
            self.listening.store(false, Ordering::Release);
            return Err(err);
        }

        self.metrics.beat();
        let worker = tokio::spawn(run_worker(
            self.queue.clone(),
            self.dedup.clone(),
            self.metrics.clone(),
            self.output.clone(),
            self.settings.clone(),
        ));
        *self.worker.lock() = Some(worker);
        info!(backend = self.backend.name(), "push listener subscribed");
        Ok(())
    }

    /// Unsubscribe and let the worker drain what is already queued.
    pub async fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::AcqRel) {
            return;
        }
        self.backend.unsubscribe();
        self.queue.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "push listener worker ended abnormally");
            }
        }
        info!(backend = self.backend.name(), "push listener stopped");
    }
}

async fn run_worker(
    queue: Arc<EventQueue>,
    dedup: Arc<DedupCache>,
    metrics: Arc<ListenerMetrics>,
    output: mpsc::UnboundedSender<MonitoringEvent>,
    settings: ListenerSettings,
) {
    loop {
        let next = tokio::time::timeout(settings.heartbeat_interval, queue.pop()).await;
        metrics.beat();
        let native = match next {
            Ok(Some(native)) => native,
            Ok(None) => break,
            Err(_) => continue,
        };

        let event = to_monitoring_event(native, settings.dedup_window);
        if !dedup.check_and_insert(&event) {
            metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if output.send(event).is_err() {
            debug!("monitor channel closed, push worker exiting");
            break;
        }
        metrics.forwarded.fetch_add(1, Ordering::Relaxed);
    }
}

fn to_monitoring_event(native: NativeEvent, window: Duration) -> MonitoringEvent {
    match native.kind {
        NativeEventKind::Created { parent_pid, name } => {
            let record = ProcessRecord::new(native.pid, name)
                .with_parent(parent_pid)
                .with_state(ProcessState::Starting);
            MonitoringEvent::new(
                EventKind::ProcessStarted,
                native.pid,
                ProcessState::Starting,
                EventSource::Push,
                native.observed_at,
                window,
            )
            .with_record(record)
        }
        NativeEventKind::Deleted { killed } => {
            let state = if killed {
                ProcessState::Killed
            } else {
                ProcessState::Exited
            };
            MonitoringEvent::new(
                EventKind::ProcessExited,
                native.pid,
                state,
                EventSource::Push,
                native.observed_at,
                window,
            )
        }
    }
}
