//! Process helpers for targets without POSIX signals, built on sysinfo.

use crate::error::CleanupError;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::Termination;

pub fn prepare_command(_cmd: &mut tokio::process::Command) {}

fn refreshed(pid: u32) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::new(),
    );
    system
}

pub fn process_alive(pid: u32) -> bool {
    pid != 0 && refreshed(pid).process(Pid::from_u32(pid)).is_some()
}

pub fn process_inaccessible(_pid: u32) -> bool {
    false
}

/// No graceful signal is available here, so the process is killed after the
/// grace period only if it has not exited on its own.
pub fn terminate_process(pid: u32, grace: Duration) -> Result<Termination, CleanupError> {
    if pid == 0 {
        return Err(CleanupError::InvalidTarget("pid 0".to_string()));
    }
    if !process_alive(pid) {
        return Ok(Termination::AlreadyGone);
    }

    let started = Instant::now();
    while started.elapsed() < grace {
        if !process_alive(pid) {
            return Ok(Termination::Graceful);
        }
        thread::sleep(Duration::from_millis(20));
    }

    let system = refreshed(pid);
    match system.process(Pid::from_u32(pid)) {
        None => Ok(Termination::Graceful),
        Some(process) => {
            if process.kill() {
                Ok(Termination::Forced)
            } else {
                Err(CleanupError::AccessDenied {
                    target: format!("pid {}", pid),
                    message: "kill request refused".to_string(),
                })
            }
        }
    }
}
