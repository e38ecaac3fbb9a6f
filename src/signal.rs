//! Host shutdown and panic hooks that fire the cleanup trigger.

use crate::cleanup::{CleanupTrigger, TriggerReason};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
    ConsoleClose,
    SystemShutdown,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "interrupt",
            ShutdownSignal::Terminate => "terminate",
            ShutdownSignal::Hangup => "hangup",
            ShutdownSignal::ConsoleClose => "console close",
            ShutdownSignal::SystemShutdown => "system shutdown",
        };
        f.write_str(name)
    }
}

/// Wait for the first signal that means the host wants us gone.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = hangup.recv() => ShutdownSignal::Hangup,
    })
}

#[cfg(windows)]
pub async fn wait_for_shutdown() -> io::Result<ShutdownSignal> {
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_shutdown};

    let mut interrupt = ctrl_c()?;
    let mut brk = ctrl_break()?;
    let mut close = ctrl_close()?;
    let mut shutdown = ctrl_shutdown()?;

    Ok(tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = brk.recv() => ShutdownSignal::Interrupt,
        _ = close.recv() => ShutdownSignal::ConsoleClose,
        _ = shutdown.recv() => ShutdownSignal::SystemShutdown,
    })
}

#[cfg(not(any(unix, windows)))]
pub async fn wait_for_shutdown() -> io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// Run the deadline-bounded host-shutdown cleanup when a signal arrives.
/// The task resolves with the signal once cleanup has returned.
pub fn spawn_shutdown_listener(trigger: CleanupTrigger) -> JoinHandle<Option<ShutdownSignal>> {
    tokio::spawn(async move {
        let signal = match wait_for_shutdown().await {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "Cannot install shutdown signal handlers");
                return None;
            }
        };
        warn!(%signal, "Shutdown signal received");
        let reports = trigger.on_host_shutdown().await;
        let clean = reports.iter().filter(|r| r.is_clean()).count();
        info!(sessions = reports.len(), clean, "Shutdown cleanup returned");
        Some(signal)
    })
}

static PANIC_HOOK: Once = Once::new();
static PANICKING: AtomicBool = AtomicBool::new(false);

/// Wipe everything registered when any thread panics, then defer to the
/// previously installed hook. Installing twice is a no-op.
pub fn install_panic_hook(trigger: CleanupTrigger) {
    PANIC_HOOK.call_once(move || {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // A panic inside the cleanup itself must not recurse.
            if !PANICKING.swap(true, Ordering::SeqCst) {
                error!(panic = %info, "Unhandled panic; wiping registered secrets");
                let result = trigger.fire_all_blocking(TriggerReason::Panic);
                if !result.success {
                    error!(failed = result.failed(), "Panic cleanup incomplete");
                }
                PANICKING.store(false, Ordering::SeqCst);
            }
            previous(info);
        }));
    });
}
