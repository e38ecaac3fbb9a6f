//! Process data model shared by the tracker, listener and monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

/// Tag applied to records whose name matched an AI tool pattern.
pub const AI_TOOL_TAG: &str = "AI-tool";
/// Tag applied to records tracked only because an ancestor is tracked.
pub const CHILD_TAG: &str = "child";

/// Last observed lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
    Killed,
    /// The process vanished from the table but could not be confirmed gone.
    Unknown,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Killed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Killed => "killed",
            ProcessState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub memory_bytes: u64,
    /// Open handle / descriptor count when the platform exposes it.
    pub handle_count: Option<u32>,
}

/// A tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
    pub parent_pid: Option<u32>,
    /// Start time reported by the OS, seconds since the epoch. Used to tell
    /// a reused pid apart from the original process.
    pub start_time: u64,
    pub state: ProcessState,
    #[serde(default)]
    pub performance: PerformanceSnapshot,
    #[serde(default)]
    pub tags: HashSet<String>,
    /// Relative importance when several processes need attention.
    #[serde(default)]
    pub weight: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pid,
            name: name.into(),
            executable_path: None,
            parent_pid: None,
            start_time: 0,
            state: ProcessState::Running,
            performance: PerformanceSnapshot::default(),
            tags: HashSet::new(),
            weight: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_parent(mut self, parent_pid: Option<u32>) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.executable_path = path;
        self
    }

    pub fn with_start_time(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_state(mut self, state: ProcessState) -> Self {
        self.state = state;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn is_ai_tool(&self) -> bool {
        self.tags.contains(AI_TOOL_TAG)
    }

    /// Whether `other` describes the same process instance (not a reused pid).
    pub fn same_instance(&self, other: &ProcessRecord) -> bool {
        self.pid == other.pid
            && (self.start_time == 0 || other.start_time == 0 || self.start_time == other.start_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessStarted,
    ProcessExited,
    ProcessStateChanged,
}

impl EventKind {
    fn discriminant(&self) -> u8 {
        match self {
            EventKind::ProcessStarted => 1,
            EventKind::ProcessExited => 2,
            EventKind::ProcessStateChanged => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Poll,
    Push,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Poll => f.write_str("poll"),
            EventSource::Push => f.write_str("push"),
        }
    }
}

/// Identity of an event for de-duplication: hash of pid, kind and time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniquenessKey(pub u64);

impl UniquenessKey {
    pub fn compute(pid: u32, kind: EventKind, bucket: i64) -> Self {
        let mut hasher = DefaultHasher::new();
        pid.hash(&mut hasher);
        kind.discriminant().hash(&mut hasher);
        bucket.hash(&mut hasher);
        UniquenessKey(hasher.finish())
    }
}

/// Time bucket of `timestamp` for a dedup window of `window`.
pub fn time_bucket(timestamp: DateTime<Utc>, window: Duration) -> i64 {
    let window_ms = window.as_millis().max(1) as i64;
    timestamp.timestamp_millis().div_euclid(window_ms)
}

/// Immutable lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub kind: EventKind,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub key: UniquenessKey,
    /// State after the transition.
    pub state: ProcessState,
    /// Snapshot of the process at observation time, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ProcessRecord>,
}

impl MonitoringEvent {
    pub fn new(
        kind: EventKind,
        pid: u32,
        state: ProcessState,
        source: EventSource,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        Self {
            kind,
            pid,
            timestamp,
            source,
            key: UniquenessKey::compute(pid, kind, time_bucket(timestamp, window)),
            state,
            record: None,
        }
    }

    pub fn with_record(mut self, record: ProcessRecord) -> Self {
        self.record = Some(record);
        self
    }

    /// Key of the same logical event in the previous time bucket.
    pub fn previous_bucket_key(&self, window: Duration) -> UniquenessKey {
        UniquenessKey::compute(self.pid, self.kind, time_bucket(self.timestamp, window) - 1)
    }

    pub fn is_exit(&self) -> bool {
        self.kind == EventKind::ProcessExited
    }
}

/// A tracked-process filter: explicit pid or a name pattern.
#[derive(Debug, Clone)]
pub enum ProcessFilter {
    Pid(u32),
    NamePattern(regex::Regex),
}

impl ProcessFilter {
    pub fn matches(&self, pid: u32, name: &str) -> bool {
        match self {
            ProcessFilter::Pid(target) => *target == pid,
            ProcessFilter::NamePattern(pattern) => pattern.is_match(name),
        }
    }
}

impl PartialEq for ProcessFilter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ProcessFilter::Pid(a), ProcessFilter::Pid(b)) => a == b,
            (ProcessFilter::NamePattern(a), ProcessFilter::NamePattern(b)) => {
                a.as_str() == b.as_str()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_is_stable_within_bucket() {
        let window = Duration::from_secs(2);
        let t0 = Utc.timestamp_millis_opt(10_000).unwrap();
        let t1 = Utc.timestamp_millis_opt(11_999).unwrap();
        let a = MonitoringEvent::new(
            EventKind::ProcessStarted,
            42,
            ProcessState::Running,
            EventSource::Poll,
            t0,
            window,
        );
        let b = MonitoringEvent::new(
            EventKind::ProcessStarted,
            42,
            ProcessState::Running,
            EventSource::Push,
            t1,
            window,
        );
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn key_differs_by_kind_and_pid() {
        let window = Duration::from_secs(2);
        let now = Utc::now();
        let start = MonitoringEvent::new(
            EventKind::ProcessStarted,
            42,
            ProcessState::Running,
            EventSource::Poll,
            now,
            window,
        );
        let exit = MonitoringEvent::new(
            EventKind::ProcessExited,
            42,
            ProcessState::Exited,
            EventSource::Poll,
            now,
            window,
        );
        let other = MonitoringEvent::new(
            EventKind::ProcessStarted,
            43,
            ProcessState::Running,
            EventSource::Poll,
            now,
            window,
        );
        assert_ne!(start.key, exit.key);
        assert_ne!(start.key, other.key);
    }

    #[test]
    fn reused_pid_is_a_different_instance() {
        let original = ProcessRecord::new(100, "claude").with_start_time(1_000);
        let reused = ProcessRecord::new(100, "bash").with_start_time(2_000);
        let unknown_start = ProcessRecord::new(100, "claude");
        assert!(!original.same_instance(&reused));
        assert!(original.same_instance(&unknown_start));
    }

    #[test]
    fn filter_matches_pid_or_pattern() {
        let pid = ProcessFilter::Pid(7);
        let pattern = ProcessFilter::NamePattern(regex::Regex::new("^codex").unwrap());
        assert!(pid.matches(7, "anything"));
        assert!(!pid.matches(8, "anything"));
        assert!(pattern.matches(1, "codex-cli"));
        assert!(!pattern.matches(1, "node"));
    }
}
