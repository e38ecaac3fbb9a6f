use crate::error::CleanupError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use super::Termination;

const EXIT_POLL_STEP: Duration = Duration::from_millis(20);
const FORCED_EXIT_WAIT: Duration = Duration::from_millis(200);

/// Put the child in its own process group and, on Linux, ask the kernel to
/// send it SIGTERM if the warden dies first.
pub fn prepare_command(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}

/// Check if a process exists. EPERM means it exists but belongs to someone else.
pub fn process_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

/// Whether the process exists but signalling it is not permitted.
pub fn process_inaccessible(pid: u32) -> bool {
    match to_pid(pid) {
        Some(target) => kill(target, None) == Err(Errno::EPERM),
        None => false,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub fn terminate_process(pid: u32, grace: Duration) -> Result<Termination, CleanupError> {
    let target = to_pid(pid).ok_or_else(|| invalid_pid(pid))?;

    if !process_alive(pid) {
        return Ok(Termination::AlreadyGone);
    }

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(Termination::AlreadyGone),
        Err(errno) => return Err(signal_error(pid, errno)),
    }

    if wait_for_exit(pid, grace) {
        return Ok(Termination::Graceful);
    }

    match kill(target, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid, "sent SIGKILL"),
        Err(Errno::ESRCH) => return Ok(Termination::Graceful),
        Err(errno) => return Err(signal_error(pid, errno)),
    }

    if wait_for_exit(pid, FORCED_EXIT_WAIT) {
        Ok(Termination::Forced)
    } else {
        Err(CleanupError::ProcessStillAlive(pid))
    }
}

fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let started = Instant::now();
    loop {
        if !process_alive(pid) {
            return true;
        }
        if started.elapsed() >= within {
            return false;
        }
        thread::sleep(EXIT_POLL_STEP);
    }
}

/// Pid 0 and negative values address process groups, never accept them.
fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

fn invalid_pid(pid: u32) -> CleanupError {
    CleanupError::InvalidTarget(format!("pid {}", pid))
}

fn signal_error(pid: u32, errno: Errno) -> CleanupError {
    let target = format!("pid {}", pid);
    match errno {
        Errno::EPERM => CleanupError::AccessDenied {
            target,
            message: errno.desc().to_string(),
        },
        _ => CleanupError::Busy {
            target,
            message: errno.desc().to_string(),
        },
    }
}

unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}
