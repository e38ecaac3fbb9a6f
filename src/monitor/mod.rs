//! Process lifecycle monitoring: a polling tracker, a push listener and the
//! coordinator that merges them.

pub mod backend;
pub mod coordinator;
pub mod dedup;
pub mod listener;
pub mod probe;
pub mod queue;
pub mod tracker;

pub use backend::{platform_backend, EventBackend, SpawnWatchBackend, SpawnWatchHandle, UnsupportedBackend};
pub use coordinator::{HealthReport, MonitorMode, MonitorSettings, MonitorStatistics, ProcessMonitor, SourceHealth};
pub use dedup::DedupCache;
pub use listener::{EventListener, ListenerSink, ListenerStats};
pub use probe::{ProbeOutcome, ProcessProbe, SysinfoProbe};
pub use tracker::{FilterSet, ProcessTracker};
