//! `ProcessMonitor`: merges the polling tracker and the push listener into
//! one de-duplicated event stream and owns the canonical process tree.
//!
//! Both sources feed a single channel consumed by one coordination task,
//! which is the only writer of the tree and the history ring while it runs.
//! Removals requested through the API are queued to the same task. When the push
//! source cannot subscribe the monitor keeps running on polling alone.

use crate::config::GuardConfig;
use crate::core::history::ProcessHistory;
use crate::core::models::{
    EventKind, EventSource, MonitoringEvent, ProcessFilter, ProcessRecord, ProcessState,
    AI_TOOL_TAG,
};
use crate::core::process_tree::{ProcessTree, TreeSnapshot};
use crate::error::{ConfigError, ListenerError, TrackerError, WardenResult};
use crate::events::{GuardNotification, NotificationBus};
use crate::monitor::backend::EventBackend;
use crate::monitor::dedup::DedupCache;
use crate::monitor::listener::{EventListener, ListenerSettings, ListenerStats};
use crate::monitor::probe::ProcessProbe;
use crate::monitor::tracker::{FilterSet, ProcessTracker, TrackerSettings};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A source is stale once it has been silent for this many intervals.
const STALE_INTERVALS: u32 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub dedup_window: Duration,
    pub unknown_grace: Duration,
    pub history_capacity: usize,
    pub listener_queue_capacity: usize,
    pub push_events: bool,
    pub ai_patterns: Vec<Regex>,
}

impl MonitorSettings {
    pub fn from_config(config: &GuardConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            poll_interval: config.poll_interval(),
            dedup_window: config.dedup_window(),
            unknown_grace: config.unknown_grace(),
            history_capacity: config.history_capacity,
            listener_queue_capacity: config.listener_queue_capacity,
            push_events: config.push_events,
            ai_patterns: config.compile_patterns()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Stopped,
    Hybrid,
    /// Degraded: the push source is unavailable.
    PollingOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub available: bool,
    pub last_success_age: Option<Duration>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub mode: MonitorMode,
    pub poll: SourceHealth,
    pub push: SourceHealth,
    /// Why the push source is unavailable, if it is.
    pub push_error: Option<String>,
}

impl HealthReport {
    /// Lifecycle events are still flowing from at least the poll source.
    pub fn is_operational(&self) -> bool {
        self.poll.available && !self.poll.stale
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatistics {
    pub mode: MonitorMode,
    pub tracked: usize,
    pub roots: usize,
    pub history: usize,
    pub forwarded: u64,
    pub duplicates_suppressed: u64,
    pub ignored: u64,
    pub poll_events: u64,
    pub push_events: u64,
    pub poll_ticks: u64,
    pub failed_poll_ticks: u64,
    pub listener: ListenerStats,
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    duplicates: AtomicU64,
    ignored: AtomicU64,
    poll_events: AtomicU64,
    push_events: AtomicU64,
}

struct MonitorShared {
    filters: FilterSet,
    ai_patterns: Vec<Regex>,
    tree: RwLock<ProcessTree>,
    history: Mutex<ProcessHistory>,
    dedup: DedupCache,
    events: broadcast::Sender<MonitoringEvent>,
    bus: NotificationBus,
    counters: Counters,
}

/// Everything the coordination task consumes; handed back when it stops.
struct Inbound {
    events: mpsc::UnboundedReceiver<MonitoringEvent>,
    forget: mpsc::UnboundedReceiver<u32>,
}

type Coordinator = (JoinHandle<Inbound>, watch::Sender<bool>);

pub struct ProcessMonitor {
    settings: MonitorSettings,
    shared: Arc<MonitorShared>,
    tracker: ProcessTracker,
    listener: EventListener,
    inbound: Mutex<Option<Inbound>>,
    forget_tx: mpsc::UnboundedSender<u32>,
    coordinator: Mutex<Option<Coordinator>>,
    mode: RwLock<MonitorMode>,
    push_error: RwLock<Option<ListenerError>>,
}

impl ProcessMonitor {
    pub fn new(
        settings: MonitorSettings,
        probe: Box<dyn ProcessProbe>,
        backend: Arc<dyn EventBackend>,
        bus: NotificationBus,
    ) -> Self {
        let filters = FilterSet::new();
        for pattern in &settings.ai_patterns {
            filters.add(ProcessFilter::NamePattern(pattern.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = ProcessTracker::new(
            probe,
            filters.clone(),
            TrackerSettings {
                dedup_window: settings.dedup_window,
                unknown_grace: settings.unknown_grace,
                ai_patterns: settings.ai_patterns.clone(),
            },
            tx.clone(),
        );
        let listener = EventListener::new(
            backend,
            ListenerSettings {
                dedup_window: settings.dedup_window,
                queue_capacity: settings.listener_queue_capacity,
                heartbeat_interval: settings.poll_interval,
            },
            tx,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (forget_tx, forget_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(MonitorShared {
                filters,
                ai_patterns: settings.ai_patterns.clone(),
                tree: RwLock::new(ProcessTree::new()),
                history: Mutex::new(ProcessHistory::new(settings.history_capacity)),
                dedup: DedupCache::new(settings.dedup_window),
                events,
                bus,
                counters: Counters::default(),
            }),
            settings,
            tracker,
            listener,
            inbound: Mutex::new(Some(Inbound {
                events: rx,
                forget: forget_rx,
            })),
            forget_tx,
            coordinator: Mutex::new(None),
            mode: RwLock::new(MonitorMode::Stopped),
            push_error: RwLock::new(None),
        }
    }

    /// Start both sources. A push subscription failure is logged and the
    /// monitor continues in polling-only mode.
    pub fn start(&self) -> WardenResult<MonitorMode> {
        let Some(inbound) = self.inbound.lock().take() else {
            return Err(TrackerError::AlreadyRunning.into());
        };

        if let Err(err) = self.tracker.start(self.settings.poll_interval) {
            *self.inbound.lock() = Some(inbound);
            return Err(err.into());
        }

        let mode = if self.settings.push_events {
            match self.listener.start_listening() {
                Ok(()) => {
                    *self.push_error.write() = None;
                    MonitorMode::Hybrid
                }
                Err(err) => {
                    warn!(
                        backend = self.listener.backend_name(),
                        error = %err,
                        "push notifications unavailable, continuing with polling only"
                    );
                    *self.push_error.write() = Some(err);
                    MonitorMode::PollingOnly
                }
            }
        } else {
            info!("push notifications disabled by configuration");
            MonitorMode::PollingOnly
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut coordinator = self.coordinator.lock();
        let task = tokio::spawn(coordinate(self.shared.clone(), inbound, stop_rx));
        *coordinator = Some((task, stop_tx));
        drop(coordinator);
        *self.mode.write() = mode;
        info!(mode = ?mode, "process monitor started");
        Ok(mode)
    }

    pub async fn stop(&self) {
        self.tracker.stop().await;
        self.listener.stop_listening().await;

        let coordinator = self.coordinator.lock().take();
        if let Some((task, stop_tx)) = coordinator {
            let _ = stop_tx.send(true);
            match task.await {
                Ok(inbound) => *self.inbound.lock() = Some(inbound),
                Err(err) => warn!(error = %err, "monitor coordinator ended abnormally"),
            }
        }
        *self.mode.write() = MonitorMode::Stopped;
        info!("process monitor stopped");
    }

    pub fn add_process(&self, filter: ProcessFilter) {
        debug!(filter = ?filter, "tracking filter added");
        self.shared.filters.add(filter);
    }

    /// Stop tracking `pid`. No exit event is emitted for it. While the
    /// monitor runs, the tree entry is dropped by the coordination task.
    pub fn remove_process(&self, pid: u32) -> bool {
        let had_filter = self.shared.filters.remove_pid(pid);
        let was_tracked = self.tracker.forget(pid);
        let coordinator = self.coordinator.lock();
        let was_in_tree = if coordinator.is_some() {
            let known = self.shared.tree.read().contains(pid);
            if self.forget_tx.send(pid).is_err() {
                warn!(pid, "monitor coordinator gone; removal not queued");
            }
            known
        } else {
            self.shared.forget(pid)
        };
        had_filter || was_tracked || was_in_tree
    }

    pub fn get_tree(&self) -> TreeSnapshot {
        self.shared.tree.read().snapshot()
    }

    /// Exited records still retained in the history ring, oldest first.
    pub fn history(&self) -> Vec<ProcessRecord> {
        self.shared.history.lock().iter().cloned().collect()
    }

    pub fn mode(&self) -> MonitorMode {
        *self.mode.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.shared.events.subscribe()
    }

    pub fn get_statistics(&self) -> MonitorStatistics {
        let tree = self.shared.tree.read();
        let counters = &self.shared.counters;
        let tracker = self.tracker.stats();
        MonitorStatistics {
            mode: self.mode(),
            tracked: tree.len(),
            roots: tree.roots().len(),
            history: self.shared.history.lock().len(),
            forwarded: counters.forwarded.load(Ordering::Relaxed),
            duplicates_suppressed: counters.duplicates.load(Ordering::Relaxed),
            ignored: counters.ignored.load(Ordering::Relaxed),
            poll_events: counters.poll_events.load(Ordering::Relaxed),
            push_events: counters.push_events.load(Ordering::Relaxed),
            poll_ticks: tracker.ticks,
            failed_poll_ticks: tracker.failed_ticks,
            listener: self.listener.metrics().snapshot(),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        let threshold = self.settings.poll_interval * STALE_INTERVALS;

        let poll_age = self.tracker.last_success_age();
        let poll_available = self.tracker.is_running();
        let poll = SourceHealth {
            available: poll_available,
            last_success_age: poll_age,
            stale: !poll_available || poll_age.map_or(true, |age| age > threshold),
        };

        let push_available = self.listener.is_listening();
        let push_age = if push_available {
            self.listener.metrics().heartbeat_age()
        } else {
            None
        };
        let push = SourceHealth {
            available: push_available,
            last_success_age: push_age,
            stale: !push_available || push_age.map_or(true, |age| age > threshold),
        };

        let push_error = self.push_error.read().as_ref().map(|e| e.to_string());
        let push_error = match push_error {
            None if !self.settings.push_events => Some("disabled by configuration".to_string()),
            other => other,
        };

        HealthReport {
            mode: self.mode(),
            poll,
            push,
            push_error,
        }
    }
}

async fn coordinate(
    shared: Arc<MonitorShared>,
    mut inbound: Inbound,
    mut stop_rx: watch::Receiver<bool>,
) -> Inbound {
    loop {
        tokio::select! {
            biased;
            Some(pid) = inbound.forget.recv() => {
                shared.forget(pid);
            }
            next = inbound.events.recv() => match next {
                Some(event) => shared.apply(event),
                None => break,
            },
            _ = stop_rx.changed() => {
                while let Ok(pid) = inbound.forget.try_recv() {
                    shared.forget(pid);
                }
                while let Ok(event) = inbound.events.try_recv() {
                    shared.apply(event);
                }
                break;
            }
        }
    }
    inbound
}

impl MonitorShared {
    fn forget(&self, pid: u32) -> bool {
        let removed = self.tree.write().remove(pid).is_some();
        if removed {
            debug!(pid, "process dropped from the tree");
        }
        removed
    }

    fn apply(&self, event: MonitoringEvent) {
        match event.source {
            EventSource::Poll => self.counters.poll_events.fetch_add(1, Ordering::Relaxed),
            EventSource::Push => self.counters.push_events.fetch_add(1, Ordering::Relaxed),
        };

        if event.source == EventSource::Push && !self.is_relevant(&event) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let fresh = self.dedup.check_and_insert(&event);
        let forward = match event.kind {
            EventKind::ProcessStarted => self.apply_started(&event, fresh),
            EventKind::ProcessExited => self.apply_exited(&event, fresh),
            EventKind::ProcessStateChanged => {
                let known = self.tree.write().set_state(event.pid, event.state);
                fresh && known
            }
        };

        if !forward {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        self.notify(&event);
        let _ = self.events.send(event);
    }

    fn is_relevant(&self, event: &MonitoringEvent) -> bool {
        match (&event.kind, &event.record) {
            (EventKind::ProcessStarted, Some(record)) => {
                self.filter_matches(record)
                    || record
                        .parent_pid
                        .map_or(false, |parent| self.tree.read().contains(parent))
            }
            (EventKind::ProcessStarted, None) => false,
            _ => self.tree.read().contains(event.pid),
        }
    }

    fn filter_matches(&self, record: &ProcessRecord) -> bool {
        self.filters.matches(record.pid, &record.name)
    }

    fn apply_started(&self, event: &MonitoringEvent, fresh: bool) -> bool {
        let mut record = event
            .record
            .clone()
            .unwrap_or_else(|| ProcessRecord::new(event.pid, ""));
        if self.ai_patterns.iter().any(|p| p.is_match(&record.name)) {
            record.tags.insert(AI_TOOL_TAG.to_string());
        }

        let mut tree = self.tree.write();
        let known = tree
            .get(event.pid)
            .map(|node| node.record())
            .filter(|existing| existing.same_instance(&record));

        match known {
            Some(existing) => {
                // Already reported; let the poller's richer record win.
                if event.source == EventSource::Poll {
                    record.first_seen = existing.first_seen;
                    record.tags.extend(existing.tags);
                    tree.upsert(record);
                }
                false
            }
            None if fresh => {
                record.state = ProcessState::Running;
                tree.upsert(record);
                true
            }
            None => false,
        }
    }

    fn apply_exited(&self, event: &MonitoringEvent, fresh: bool) -> bool {
        if !fresh {
            return false;
        }
        let removed = self.tree.write().remove(event.pid);
        match removed {
            Some(mut record) => {
                record.state = event.state;
                record.last_seen = event.timestamp;
                self.history.lock().push(record);
                true
            }
            None => false,
        }
    }

    fn notify(&self, event: &MonitoringEvent) {
        match event.kind {
            EventKind::ProcessStarted => {
                let record = event.record.as_ref();
                self.bus.publish(GuardNotification::ProcessStarted {
                    pid: event.pid,
                    name: record.map(|r| r.name.clone()).unwrap_or_default(),
                    parent_pid: record.and_then(|r| r.parent_pid),
                    ai_tool: record.map_or(false, |r| {
                        r.is_ai_tool() || self.ai_patterns.iter().any(|p| p.is_match(&r.name))
                    }),
                });
            }
            EventKind::ProcessExited => {
                let name = self.history.lock().find(event.pid).map(|r| r.name.clone());
                self.bus.publish(GuardNotification::ProcessExited {
                    pid: event.pid,
                    name,
                    state: event.state,
                });
            }
            EventKind::ProcessStateChanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::backend::{SpawnWatchBackend, UnsupportedBackend};
    use crate::monitor::probe::ProbeOutcome;

    #[derive(Clone, Default)]
    struct Table(Arc<Mutex<Vec<ProcessRecord>>>);

    struct TableProbe(Table);

    impl ProcessProbe for TableProbe {
        fn enumerate(&mut self) -> Result<Vec<ProcessRecord>, TrackerError> {
            Ok(self.0 .0.lock().clone())
        }

        fn probe(&mut self, pid: u32) -> ProbeOutcome {
            match self.0 .0.lock().iter().find(|r| r.pid == pid) {
                Some(r) => ProbeOutcome::Alive(r.clone()),
                None => ProbeOutcome::Gone,
            }
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(20),
            dedup_window: Duration::from_secs(2),
            unknown_grace: Duration::from_secs(1),
            history_capacity: 8,
            listener_queue_capacity: 32,
            push_events: true,
            ai_patterns: vec![Regex::new("(?i)claude").unwrap()],
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<MonitoringEvent>) -> MonitoringEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn falls_back_to_polling_when_push_unavailable() {
        let table = Table::default();
        let monitor = ProcessMonitor::new(
            settings(),
            Box::new(TableProbe(table.clone())),
            Arc::new(UnsupportedBackend::new("none")),
            NotificationBus::default(),
        );
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.start().unwrap(), MonitorMode::PollingOnly);

        table
            .0
            .lock()
            .push(ProcessRecord::new(50, "claude").with_start_time(3));
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, EventKind::ProcessStarted);
        assert_eq!(event.source, EventSource::Poll);

        let health = monitor.check_health();
        assert!(health.is_operational());
        assert!(health.push.stale);
        assert!(!health.push.available);
        assert!(health.push_error.is_some());

        monitor.stop().await;
        assert_eq!(monitor.mode(), MonitorMode::Stopped);
    }

    #[tokio::test]
    async fn push_and_poll_reports_collapse_to_one_event() {
        let table = Table::default();
        let backend = SpawnWatchBackend::new();
        let handle = backend.handle();
        let monitor = ProcessMonitor::new(
            settings(),
            Box::new(TableProbe(table.clone())),
            Arc::new(backend),
            NotificationBus::default(),
        );
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.start().unwrap(), MonitorMode::Hybrid);

        handle.announce_started(60, None, "claude");
        table
            .0
            .lock()
            .push(ProcessRecord::new(60, "claude").with_start_time(4));

        let first = next_event(&mut rx).await;
        assert_eq!(first.kind, EventKind::ProcessStarted);

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.announce_exited(60, false);
        table.0.lock().clear();

        let exit = next_event(&mut rx).await;
        assert_eq!(exit.kind, EventKind::ProcessExited);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        let stats = monitor.get_statistics();
        assert_eq!(stats.forwarded, 2);
        assert!(stats.duplicates_suppressed >= 2);
        assert_eq!(monitor.history().len(), 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn children_join_the_tree_under_their_parent() {
        let table = Table::default();
        table.0.lock().extend([
            ProcessRecord::new(70, "claude").with_start_time(1),
            ProcessRecord::new(71, "node")
                .with_parent(Some(70))
                .with_start_time(2),
        ]);
        let monitor = ProcessMonitor::new(
            settings(),
            Box::new(TableProbe(table.clone())),
            Arc::new(UnsupportedBackend::new("none")),
            NotificationBus::default(),
        );
        let mut rx = monitor.subscribe();
        monitor.start().unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        let tree = monitor.get_tree();
        assert_eq!(tree.level(70), Some(0));
        assert_eq!(tree.level(71), Some(1));

        assert!(monitor.remove_process(71));
        let mut gone = false;
        for _ in 0..50 {
            if !monitor.get_tree().contains(71) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn removal_is_applied_by_the_coordination_task() {
        let table = Table::default();
        table
            .0
            .lock()
            .push(ProcessRecord::new(90, "claude").with_start_time(1));
        let monitor = ProcessMonitor::new(
            settings(),
            Box::new(TableProbe(table.clone())),
            Arc::new(UnsupportedBackend::new("none")),
            NotificationBus::default(),
        );
        let mut rx = monitor.subscribe();
        monitor.start().unwrap();
        next_event(&mut rx).await;

        assert!(monitor.remove_process(90));

        monitor.stop().await;
        assert!(!monitor.get_tree().contains(90));
        assert!(monitor.history().is_empty());

        assert!(!monitor.remove_process(90));
    }

    #[tokio::test]
    async fn unrelated_push_events_are_ignored() {
        let backend = SpawnWatchBackend::new();
        let handle = backend.handle();
        let monitor = ProcessMonitor::new(
            settings(),
            Box::new(TableProbe(Table::default())),
            Arc::new(backend),
            NotificationBus::default(),
        );
        monitor.start().unwrap();
        handle.announce_started(80, None, "vim");
        handle.announce_exited(81, false);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = monitor.get_statistics();
        assert_eq!(stats.ignored, 2);
        assert_eq!(stats.forwarded, 0);
        monitor.stop().await;
    }
}
