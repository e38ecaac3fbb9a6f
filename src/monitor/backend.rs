//! Pluggable push-notification backends for the event listener.
//!
//! No operating-system facility (netlink proc connector, ETW, kqueue) is
//! wired up. The only push source is [`SpawnWatchBackend`], which `run`
//! feeds with the children it launches. Everything else, including the
//! `monitor` command, is observed by polling.

use crate::error::ListenerError;
use crate::monitor::listener::ListenerSink;
use parking_lot::Mutex;
use std::sync::Arc;

/// A platform facility that reports process creation and deletion.
///
/// `subscribe` must return promptly; notifications are delivered later
/// through the sink from whatever thread the facility uses.
pub trait EventBackend: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe(&self, sink: ListenerSink) -> Result<(), ListenerError>;

    fn unsubscribe(&self);
}

/// Backend for hosts without a usable process-event facility. Subscribing
/// always fails, which puts the monitor in polling-only mode.
#[derive(Debug, Clone)]
pub struct UnsupportedBackend {
    platform: String,
}

impl UnsupportedBackend {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

impl EventBackend for UnsupportedBackend {
    fn name(&self) -> &str {
        &self.platform
    }

    fn subscribe(&self, _sink: ListenerSink) -> Result<(), ListenerError> {
        Err(ListenerError::Unsupported {
            backend: self.platform.clone(),
        })
    }

    fn unsubscribe(&self) {}
}

/// Backend fed by the warden itself: whoever spawns a child announces it
/// through a [`SpawnWatchHandle`], and its exit status when reaped.
#[derive(Debug, Clone, Default)]
pub struct SpawnWatchBackend {
    sink: Arc<Mutex<Option<ListenerSink>>>,
}

impl SpawnWatchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SpawnWatchHandle {
        SpawnWatchHandle {
            sink: self.sink.clone(),
        }
    }
}

impl EventBackend for SpawnWatchBackend {
    fn name(&self) -> &str {
        "spawn-watch"
    }

    fn subscribe(&self, sink: ListenerSink) -> Result<(), ListenerError> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return Err(ListenerError::AlreadyListening);
        }
        *slot = Some(sink);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.sink.lock().take();
    }
}

#[derive(Debug, Clone)]
pub struct SpawnWatchHandle {
    sink: Arc<Mutex<Option<ListenerSink>>>,
}

impl SpawnWatchHandle {
    /// Returns `false` when nobody is listening.
    pub fn announce_started(&self, pid: u32, parent_pid: Option<u32>, name: &str) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                sink.on_process_created(pid, parent_pid, name);
                true
            }
            None => false,
        }
    }

    pub fn announce_exited(&self, pid: u32, killed: bool) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                sink.on_process_deleted(pid, killed);
                true
            }
            None => false,
        }
    }
}

/// The push backend for the current platform. Always refuses to
/// subscribe, leaving the monitor in polling-only mode; callers that launch
/// their own children should pass a [`SpawnWatchBackend`] instead.
pub fn platform_backend() -> Arc<dyn EventBackend> {
    Arc::new(UnsupportedBackend::new(std::env::consts::OS))
}
