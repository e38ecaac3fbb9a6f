//! OS process helpers used by the tracker, the cleanup executor and the
//! supervisor.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{prepare_command, process_alive, process_inaccessible, terminate_process};

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
pub use fallback::{prepare_command, process_alive, process_inaccessible, terminate_process};

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to do; the process was not running.
    AlreadyGone,
    Graceful,
    Forced,
}
