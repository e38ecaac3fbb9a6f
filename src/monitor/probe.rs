//! Access to the OS process table.
//!
//! The tracker never talks to sysinfo directly; it goes through
//! [`ProcessProbe`] so tests can script process appearances, exits and
//! permission failures.

use crate::core::models::{PerformanceSnapshot, ProcessRecord, ProcessState};
use crate::error::TrackerError;
use crate::platform;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};

/// Result of looking up one process by pid.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Alive(ProcessRecord),
    Gone,
    /// The pid still exists but cannot be inspected (permission, race).
    Inaccessible,
}

pub trait ProcessProbe: Send {
    /// Every process currently visible in the table.
    fn enumerate(&mut self) -> Result<Vec<ProcessRecord>, TrackerError>;

    /// Re-check a single process.
    fn probe(&mut self, pid: u32) -> ProbeOutcome;
}

/// Default probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn enumerate(&mut self) -> Result<Vec<ProcessRecord>, TrackerError> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let records: Vec<ProcessRecord> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| record_from(pid.as_u32(), process))
            .collect();
        if records.is_empty() {
            return Err(TrackerError::Enumeration(
                "process table returned no entries".to_string(),
            ));
        }
        Ok(records)
    }

    fn probe(&mut self, pid: u32) -> ProbeOutcome {
        let target = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );
        match self.system.process(target) {
            Some(process) => ProbeOutcome::Alive(record_from(pid, process)),
            None if platform::process_inaccessible(pid) => ProbeOutcome::Inaccessible,
            None if platform::process_alive(pid) => ProbeOutcome::Inaccessible,
            None => ProbeOutcome::Gone,
        }
    }
}

fn record_from(pid: u32, process: &Process) -> ProcessRecord {
    let mut record = ProcessRecord::new(pid, process.name().to_string_lossy())
        .with_parent(process.parent().map(|p| p.as_u32()))
        .with_path(process.exe().map(|p| p.to_path_buf()))
        .with_start_time(process.start_time())
        .with_state(ProcessState::Running);
    record.performance = PerformanceSnapshot {
        memory_bytes: process.memory(),
        handle_count: handle_count(pid),
    };
    record
}

#[cfg(target_os = "linux")]
fn handle_count(pid: u32) -> Option<u32> {
    std::fs::read_dir(format!("/proc/{}/fd", pid))
        .ok()
        .map(|entries| entries.count() as u32)
}

#[cfg(not(target_os = "linux"))]
fn handle_count(_pid: u32) -> Option<u32> {
    None
}
