//! Polling fallback: periodically enumerates the process table, diffs it
//! against the previous snapshot and emits lifecycle events.
//!
//! A process is tracked when its pid or name matches a filter, or when its
//! parent is tracked. A tracked process that disappears from the table is
//! probed individually; if it cannot be inspected it is marked `Unknown`
//! and only reported as exited once a probe confirms it or the grace
//! window runs out.

use crate::core::models::{
    EventKind, EventSource, MonitoringEvent, ProcessFilter, ProcessRecord, ProcessState,
    AI_TOOL_TAG, CHILD_TAG,
};
use crate::error::TrackerError;
use crate::monitor::probe::{ProbeOutcome, ProcessProbe};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Shared, mutable set of tracking filters.
#[derive(Debug, Clone, Default)]
pub struct FilterSet(Arc<RwLock<Vec<ProcessFilter>>>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: ProcessFilter) {
        let mut filters = self.0.write();
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }

    /// Remove an explicit pid filter. Returns whether one was present.
    pub fn remove_pid(&self, pid: u32) -> bool {
        let mut filters = self.0.write();
        let before = filters.len();
        filters.retain(|f| !matches!(f, ProcessFilter::Pid(p) if *p == pid));
        filters.len() != before
    }

    pub fn matches(&self, pid: u32, name: &str) -> bool {
        self.0.read().iter().any(|f| f.matches(pid, name))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub dedup_window: Duration,
    pub unknown_grace: Duration,
    /// Names matching any of these are tagged as AI tools.
    pub ai_patterns: Vec<Regex>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub tracked: usize,
}

#[derive(Debug, Default)]
struct TrackerState {
    tracked: HashMap<u32, ProcessRecord>,
    unknown_since: HashMap<u32, DateTime<Utc>>,
    /// Pids dropped by `forget` that must not be re-adopted as children.
    ignored: HashMap<u32, u64>,
}

struct TrackerInner {
    probe: Mutex<Box<dyn ProcessProbe>>,
    filters: FilterSet,
    settings: TrackerSettings,
    state: Mutex<TrackerState>,
    last_success: Mutex<Option<Instant>>,
    ticks: AtomicU64,
    failed_ticks: AtomicU64,
}

pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
    output: mpsc::UnboundedSender<MonitoringEvent>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTracker {
    pub fn new(
        probe: Box<dyn ProcessProbe>,
        filters: FilterSet,
        settings: TrackerSettings,
        output: mpsc::UnboundedSender<MonitoringEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                probe: Mutex::new(probe),
                filters,
                settings,
                state: Mutex::new(TrackerState::default()),
                last_success: Mutex::new(None),
                ticks: AtomicU64::new(0),
                failed_ticks: AtomicU64::new(0),
            }),
            output,
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Start polling every `interval`. The first tick runs immediately.
    pub fn start(&self, interval: Duration) -> Result<(), TrackerError> {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return Err(TrackerError::AlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let output = self.output.clone();
        let interval = interval.max(Duration::from_millis(1));

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }

                let tick_inner = inner.clone();
                let events = match tokio::task::spawn_blocking(move || tick_inner.tick()).await {
                    Ok(Ok(events)) => events,
                    Ok(Err(err)) => {
                        warn!(error = %err, "process poll failed");
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "process poll task panicked");
                        continue;
                    }
                };
                for event in events {
                    if output.send(event).is_err() {
                        debug!("monitor channel closed, tracker exiting");
                        return;
                    }
                }
            }
        }));
        *self.stop_tx.lock() = Some(stop_tx);
        info!(interval_ms = interval.as_millis() as u64, "process tracker started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "process tracker task ended abnormally");
            }
            info!("process tracker stopped");
        }
    }

    /// Run one poll cycle synchronously and return the events it produced.
    /// The running poll loop uses the same path.
    pub fn tick(&self) -> Result<Vec<MonitoringEvent>, TrackerError> {
        self.inner.tick()
    }

    /// Currently tracked processes, ordered by pid.
    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        let state = self.inner.state.lock();
        let ordered: BTreeMap<u32, ProcessRecord> = state
            .tracked
            .iter()
            .map(|(pid, record)| (*pid, record.clone()))
            .collect();
        ordered.into_values().collect()
    }

    /// Stop tracking `pid` without emitting an exit for it.
    pub fn forget(&self, pid: u32) -> bool {
        let mut state = self.inner.state.lock();
        state.unknown_since.remove(&pid);
        match state.tracked.remove(&pid) {
            Some(record) => {
                state.ignored.insert(pid, record.start_time);
                true
            }
            None => false,
        }
    }

    pub fn last_success_age(&self) -> Option<Duration> {
        self.inner.last_success.lock().map(|at| at.elapsed())
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            ticks: self.inner.ticks.load(Ordering::Relaxed),
            failed_ticks: self.inner.failed_ticks.load(Ordering::Relaxed),
            tracked: self.inner.state.lock().tracked.len(),
        }
    }
}

impl TrackerInner {
    fn tick(&self) -> Result<Vec<MonitoringEvent>, TrackerError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut probe = self.probe.lock();
        let listing = match probe.enumerate() {
            Ok(listing) => listing,
            Err(err) => {
                self.failed_ticks.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let now = Utc::now();
        let window = self.settings.dedup_window;
        let mut state = self.state.lock();
        if !state.ignored.is_empty() {
            // An ignored instance that is no longer listed can never return.
            let listed: HashMap<u32, u64> = listing.iter().map(|r| (r.pid, r.start_time)).collect();
            state
                .ignored
                .retain(|pid, start_time| listed.get(pid) == Some(start_time));
        }
        let current = self.select_tracked(listing, &state);
        let mut events = Vec::new();

        for (pid, mut record) in current.iter().map(|(p, r)| (*p, r.clone())) {
            match state.tracked.get(&pid) {
                None => {
                    record.first_seen = now;
                    record.last_seen = now;
                    trace!(pid, name = %record.name, "process started");
                    events.push(
                        MonitoringEvent::new(
                            EventKind::ProcessStarted,
                            pid,
                            ProcessState::Running,
                            EventSource::Poll,
                            now,
                            window,
                        )
                        .with_record(record.clone()),
                    );
                }
                Some(previous) if !previous.same_instance(&record) => {
                    debug!(pid, old = %previous.name, new = %record.name, "pid reused");
                    let mut gone = previous.clone();
                    gone.state = ProcessState::Exited;
                    gone.last_seen = now;
                    events.push(exit_event(gone, now, window));
                    record.first_seen = now;
                    record.last_seen = now;
                    events.push(
                        MonitoringEvent::new(
                            EventKind::ProcessStarted,
                            pid,
                            ProcessState::Running,
                            EventSource::Poll,
                            now,
                            window,
                        )
                        .with_record(record.clone()),
                    );
                }
                Some(previous) => {
                    record.first_seen = previous.first_seen;
                    record.last_seen = now;
                    if previous.state != ProcessState::Running {
                        events.push(
                            MonitoringEvent::new(
                                EventKind::ProcessStateChanged,
                                pid,
                                ProcessState::Running,
                                EventSource::Poll,
                                now,
                                window,
                            )
                            .with_record(record.clone()),
                        );
                    }
                }
            }
            state.unknown_since.remove(&pid);
            state.tracked.insert(pid, record);
        }

        let missing: Vec<u32> = state
            .tracked
            .keys()
            .filter(|pid| !current.contains_key(pid))
            .copied()
            .collect();

        for pid in missing {
            let outcome = probe.probe(pid);
            let Some(previous) = state.tracked.get(&pid).cloned() else {
                continue;
            };
            match outcome {
                ProbeOutcome::Alive(found) if previous.same_instance(&found) => {
                    // Raced with enumeration; still here.
                    if let Some(record) = state.tracked.get_mut(&pid) {
                        record.last_seen = now;
                    }
                }
                ProbeOutcome::Alive(_) | ProbeOutcome::Gone => {
                    state.tracked.remove(&pid);
                    state.unknown_since.remove(&pid);
                    let mut gone = previous;
                    gone.state = ProcessState::Exited;
                    gone.last_seen = now;
                    events.push(exit_event(gone, now, window));
                }
                ProbeOutcome::Inaccessible => {
                    let since = *state.unknown_since.entry(pid).or_insert(now);
                    if previous.state != ProcessState::Unknown {
                        if let Some(record) = state.tracked.get_mut(&pid) {
                            record.state = ProcessState::Unknown;
                        }
                        debug!(pid, "tracked process inaccessible, marked unknown");
                        events.push(MonitoringEvent::new(
                            EventKind::ProcessStateChanged,
                            pid,
                            ProcessState::Unknown,
                            EventSource::Poll,
                            now,
                            window,
                        ));
                    } else if elapsed(since, now) >= self.settings.unknown_grace {
                        state.tracked.remove(&pid);
                        state.unknown_since.remove(&pid);
                        let mut gone = previous;
                        gone.state = ProcessState::Exited;
                        gone.last_seen = now;
                        warn!(pid, "unknown process not seen within grace window, assuming exit");
                        events.push(exit_event(gone, now, window));
                    }
                }
            }
        }

        *self.last_success.lock() = Some(Instant::now());
        Ok(events)
    }

    /// Direct filter matches plus every descendant of a tracked process.
    fn select_tracked(
        &self,
        listing: Vec<ProcessRecord>,
        state: &TrackerState,
    ) -> HashMap<u32, ProcessRecord> {
        let mut candidates: HashMap<u32, ProcessRecord> = HashMap::with_capacity(listing.len());
        for record in listing {
            if let Some(start_time) = state.ignored.get(&record.pid) {
                if *start_time == record.start_time {
                    continue;
                }
            }
            candidates.insert(record.pid, record);
        }

        let mut selected: HashMap<u32, ProcessRecord> = HashMap::new();
        for record in candidates.values() {
            let direct = self.filters.matches(record.pid, &record.name);
            let known = state
                .tracked
                .get(&record.pid)
                .map_or(false, |previous| previous.same_instance(record));
            if direct || known {
                selected.insert(record.pid, self.tag(record.clone(), direct));
            }
        }

        loop {
            let adopted: Vec<ProcessRecord> = candidates
                .values()
                .filter(|r| !selected.contains_key(&r.pid))
                .filter(|r| r.parent_pid.map_or(false, |p| selected.contains_key(&p)))
                .cloned()
                .collect();
            if adopted.is_empty() {
                break;
            }
            for record in adopted {
                selected.insert(record.pid, self.tag(record, false));
            }
        }
        selected
    }

    fn tag(&self, mut record: ProcessRecord, direct: bool) -> ProcessRecord {
        if self
            .settings
            .ai_patterns
            .iter()
            .any(|p| p.is_match(&record.name))
        {
            record.tags.insert(AI_TOOL_TAG.to_string());
        }
        if !direct {
            record.tags.insert(CHILD_TAG.to_string());
        }
        record
    }
}

fn exit_event(record: ProcessRecord, now: DateTime<Utc>, window: Duration) -> MonitoringEvent {
    MonitoringEvent::new(
        EventKind::ProcessExited,
        record.pid,
        ProcessState::Exited,
        EventSource::Poll,
        now,
        window,
    )
    .with_record(record)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}
