//! Fakes shared by the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use secret_warden::cleanup::{CleanupTarget, ExecOutcome, TargetExecutor};
use secret_warden::config::GuardConfig;
use secret_warden::error::{CleanupError, TrackerError};
use secret_warden::monitor::{ProbeOutcome, ProcessProbe};
use secret_warden::ProcessRecord;
use std::sync::Arc;
use std::time::Duration;

/// Process table the test edits directly.
#[derive(Clone, Default)]
pub struct Table(Arc<Mutex<Vec<ProcessRecord>>>);

impl Table {
    pub fn spawn(&self, pid: u32, name: &str) {
        self.0
            .lock()
            .push(ProcessRecord::new(pid, name).with_start_time(u64::from(pid)));
    }

    pub fn exit(&self, pid: u32) {
        self.0.lock().retain(|r| r.pid != pid);
    }

    pub fn probe(&self) -> Box<dyn ProcessProbe> {
        Box::new(TableProbe(self.clone()))
    }
}

struct TableProbe(Table);

impl ProcessProbe for TableProbe {
    fn enumerate(&mut self) -> Result<Vec<ProcessRecord>, TrackerError> {
        Ok(self.0 .0.lock().clone())
    }

    fn probe(&mut self, pid: u32) -> ProbeOutcome {
        match self.0 .0.lock().iter().find(|r| r.pid == pid) {
            Some(record) => ProbeOutcome::Alive(record.clone()),
            None => ProbeOutcome::Gone,
        }
    }
}

/// Executor that takes `delay` per target and never touches the host.
pub struct SlowExecutor {
    pub delay: Duration,
}

impl TargetExecutor for SlowExecutor {
    fn execute(&self, _target: &CleanupTarget) -> Result<ExecOutcome, CleanupError> {
        std::thread::sleep(self.delay);
        Ok(ExecOutcome::Cleaned)
    }
}

pub fn fast_config() -> GuardConfig {
    GuardConfig {
        poll_interval_ms: 25,
        dedup_window_ms: 2000,
        unknown_grace_ms: 200,
        retry_backoff_ms: 5,
        operation_timeout_ms: 500,
        process_grace_ms: 100,
        shutdown_deadline_ms: 2000,
        audit_log_path: None,
        ..GuardConfig::default()
    }
}
