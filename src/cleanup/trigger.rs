//! Per-session cleanup state machine: `Idle -> Armed -> Firing -> Completed`.
//!
//! Any number of firing signals for one session collapse into a single
//! cleanup run; every caller receives the same [`SessionReport`].

use crate::audit::{AuditEventType, AuditRecord, AuditSeverity, SecurityAuditor};
use crate::cleanup::manager::{audit_outcome, CleanupManager};
use crate::cleanup::operation::{CleanupPriority, CleanupResult, CleanupStatus, CleanupTarget};
use crate::cleanup::registry::{SecretMetadata, SensitiveRegistry};
use crate::cleanup::validator::{CleanupValidator, ValidationResult, ValidationScope};
use crate::core::models::{MonitoringEvent, ProcessState};
use crate::error::{CleanupError, TriggerError};
use crate::events::{GuardNotification, NotificationBus};
use crate::platform;
use crate::secure::{HandleId, SecureHandle};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACTOR: &str = "cleanup-trigger";

/// Completed sessions kept around for [`CleanupTrigger::report`].
const COMPLETED_RETAINED: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerReason {
    OwnerExited { pid: u32 },
    OwnerKilled { pid: u32 },
    Panic,
    Timeout,
    HostShutdown,
    /// The supervised program never started.
    SpawnFailed,
    /// The warden itself is stopping.
    Stopped,
    Manual,
}

impl TriggerReason {
    /// Shutdown-path cleanups do not wait for validation.
    pub fn skips_validation(&self) -> bool {
        matches!(self, TriggerReason::HostShutdown | TriggerReason::Panic)
    }

    fn severity(&self) -> AuditSeverity {
        match self {
            TriggerReason::OwnerExited { .. }
            | TriggerReason::Manual
            | TriggerReason::Timeout
            | TriggerReason::Stopped => AuditSeverity::Info,
            TriggerReason::OwnerKilled { .. } | TriggerReason::HostShutdown | TriggerReason::SpawnFailed => {
                AuditSeverity::Warning
            }
            TriggerReason::Panic => AuditSeverity::Critical,
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::OwnerExited { pid } => write!(f, "owner {} exited", pid),
            TriggerReason::OwnerKilled { pid } => write!(f, "owner {} killed", pid),
            TriggerReason::Panic => f.write_str("panic"),
            TriggerReason::Timeout => f.write_str("timeout"),
            TriggerReason::HostShutdown => f.write_str("host shutdown"),
            TriggerReason::SpawnFailed => f.write_str("spawn failed"),
            TriggerReason::Stopped => f.write_str("warden stopped"),
            TriggerReason::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Armed,
    Firing,
    Completed,
}

/// Everything one firing produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session: SessionId,
    pub reason: TriggerReason,
    pub cleanup: CleanupResult,
    pub validation: Option<ValidationResult>,
    pub reattempt: Option<CleanupResult>,
    pub revalidation: Option<ValidationResult>,
    pub completed_at: DateTime<Utc>,
}

impl SessionReport {
    /// Result of the last cleanup run (the re-attempt if there was one).
    pub fn final_cleanup(&self) -> &CleanupResult {
        self.reattempt.as_ref().unwrap_or(&self.cleanup)
    }

    pub fn final_validation(&self) -> Option<&ValidationResult> {
        self.revalidation.as_ref().or(self.validation.as_ref())
    }

    /// The last cleanup run succeeded and, if validation ran, nothing was
    /// left behind.
    pub fn is_clean(&self) -> bool {
        let validated = self.final_validation().map_or(true, |v| v.passed);
        validated && self.final_cleanup().success
    }

    fn deadline_missed(session: SessionId, reason: TriggerReason) -> Self {
        Self {
            session,
            reason,
            cleanup: CleanupResult::rejected(Uuid::new_v4(), CleanupError::DeadlineExceeded.to_string()),
            validation: None,
            reattempt: None,
            revalidation: None,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    pub shutdown_deadline: Duration,
}

struct Session {
    owner_pid: Option<u32>,
    state: SessionState,
    targets: Vec<CleanupTarget>,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
    done: Arc<watch::Sender<Option<SessionReport>>>,
}

impl Session {
    fn arm(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Armed;
        }
    }

    /// A delivered report means completed, even if the table could not be
    /// updated at the time.
    fn current_state(&self) -> SessionState {
        if self.done.borrow().is_some() {
            SessionState::Completed
        } else {
            self.state
        }
    }
}

struct TriggerInner {
    settings: TriggerSettings,
    manager: Arc<CleanupManager>,
    validator: Arc<CleanupValidator>,
    registry: Arc<SensitiveRegistry>,
    auditor: Arc<SecurityAuditor>,
    bus: NotificationBus,
    sessions: Mutex<HashMap<SessionId, Session>>,
    /// Completion order; only touched while `sessions` is held.
    retired: Mutex<VecDeque<SessionId>>,
}

/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct CleanupTrigger {
    inner: Arc<TriggerInner>,
}

impl CleanupTrigger {
    pub fn new(
        settings: TriggerSettings,
        manager: Arc<CleanupManager>,
        validator: Arc<CleanupValidator>,
        auditor: Arc<SecurityAuditor>,
        bus: NotificationBus,
    ) -> Self {
        let registry = manager.registry().clone();
        Self {
            inner: Arc::new(TriggerInner {
                settings,
                manager,
                validator,
                registry,
                auditor,
                bus,
                sessions: Mutex::new(HashMap::new()),
                retired: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// New session in `Idle`. With a timeout, the clock starts when the
    /// session is armed.
    pub fn open_session(&self, owner_pid: Option<u32>, timeout: Option<Duration>) -> SessionId {
        let id = SessionId::new();
        let (done, _) = watch::channel(None);
        self.inner.sessions.lock().insert(
            id,
            Session {
                owner_pid,
                state: SessionState::Idle,
                targets: Vec::new(),
                timeout,
                timer: None,
                done: Arc::new(done),
            },
        );
        debug!(session = %id, ?owner_pid, "Session opened");
        id
    }

    /// Drop a session that never armed. Returns false for any other state.
    pub fn discard_idle(&self, id: SessionId) -> bool {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get(&id) {
            Some(session) if session.current_state() == SessionState::Idle => {
                sessions.remove(&id);
                debug!(session = %id, "Idle session discarded");
                true
            }
            _ => false,
        }
    }

    pub fn set_owner(&self, id: SessionId, pid: u32) -> Result<(), TriggerError> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| TriggerError::SessionNotFound(id.to_string()))?;
        session.owner_pid = Some(pid);
        Ok(())
    }

    pub fn attach_secret(
        &self,
        id: SessionId,
        handle: Arc<SecureHandle>,
        metadata: SecretMetadata,
    ) -> Result<HandleId, TriggerError> {
        self.attach(id, || {
            let handle_id = self.inner.registry.register_secret(handle, metadata);
            Ok((CleanupTarget::Memory(handle_id), handle_id))
        })
    }

    pub fn attach_environment_variable(&self, id: SessionId, name: &str) -> Result<(), TriggerError> {
        self.attach(id, || {
            self.inner
                .registry
                .register_environment_variable(name)
                .map_err(|e| TriggerError::InvalidTarget(e.to_string()))?;
            Ok((CleanupTarget::EnvironmentVariable(name.to_string()), ()))
        })
    }

    pub fn attach_transient_file(&self, id: SessionId, path: impl Into<PathBuf>) -> Result<(), TriggerError> {
        let path = path.into();
        self.attach(id, || {
            self.inner.registry.register_transient_file(path.clone());
            Ok((CleanupTarget::ConfigFile(path), ()))
        })
    }

    /// Terminate `pid` as part of this session's cleanup.
    pub fn attach_process(&self, id: SessionId, pid: u32) -> Result<(), TriggerError> {
        self.attach(id, || Ok((CleanupTarget::Process { pid }, ())))
    }

    fn attach<T>(
        &self,
        id: SessionId,
        register: impl FnOnce() -> Result<(CleanupTarget, T), TriggerError>,
    ) -> Result<T, TriggerError> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| TriggerError::SessionNotFound(id.to_string()))?;
        if matches!(session.current_state(), SessionState::Firing | SessionState::Completed) {
            return Err(TriggerError::AlreadyFired(id.to_string()));
        }

        let (target, value) = register()?;
        debug!(session = %id, target = %target, "Target attached");
        session.targets.push(target);

        if session.state == SessionState::Idle {
            session.arm();
            info!(session = %id, owner = ?session.owner_pid, "Session armed");
            self.audit(
                AuditRecord::new(AuditEventType::SessionArmed, ACTOR)
                    .detail("session", id)
                    .detail(
                        "owner_pid",
                        session.owner_pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    ),
            );
            if let Some(timeout) = session.timeout {
                session.timer = self.arm_timer(id, timeout);
            }
        }
        Ok(value)
    }

    fn arm_timer(&self, id: SessionId, timeout: Duration) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(session = %id, "No async runtime; session timeout not armed");
                return None;
            }
        };
        let weak: Weak<TriggerInner> = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let trigger = CleanupTrigger { inner };
                if let Err(err) = trigger.fire(id, TriggerReason::Timeout).await {
                    debug!(session = %id, error = %err, "Timeout fire ignored");
                }
            }
        }))
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.inner.sessions.lock().get(&id).map(Session::current_state)
    }

    pub fn report(&self, id: SessionId) -> Option<SessionReport> {
        self.inner
            .sessions
            .lock()
            .get(&id)
            .and_then(|s| s.done.borrow().clone())
    }

    pub fn sessions(&self) -> Vec<(SessionId, SessionState)> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| (*id, s.current_state()))
            .collect();
        sessions.sort();
        sessions
    }

    /// Fire a session and wait for its report. Concurrent calls for the same
    /// session run one cleanup and all receive its report.
    pub async fn fire(&self, id: SessionId, reason: TriggerReason) -> Result<SessionReport, TriggerError> {
        let mut done = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(&id)
                .ok_or_else(|| TriggerError::SessionNotFound(id.to_string()))?;
            match session.current_state() {
                SessionState::Idle => return Err(TriggerError::NotArmed(id.to_string())),
                SessionState::Armed => {
                    session.state = SessionState::Firing;
                    if let Some(timer) = session.timer.take() {
                        // The timer task may be the caller; only cancel others.
                        if reason != TriggerReason::Timeout {
                            timer.abort();
                        }
                    }
                    info!(session = %id, reason = %reason, "Cleanup trigger firing");
                    let inner = self.inner.clone();
                    let targets = session.targets.clone();
                    let done = session.done.clone();
                    let firing_reason = reason.clone();
                    tokio::spawn(async move {
                        let report = AssertUnwindSafe(run_session(&inner, id, firing_reason.clone(), targets))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                error!(session = %id, "Session cleanup panicked");
                                SessionReport {
                                    cleanup: CleanupResult::rejected(
                                        Uuid::new_v4(),
                                        CleanupError::Worker("cleanup task panicked".into()).to_string(),
                                    ),
                                    ..SessionReport::deadline_missed(id, firing_reason)
                                }
                            });
                        inner.complete(id, &done, report);
                    });
                }
                SessionState::Firing | SessionState::Completed => {
                    debug!(session = %id, reason = %reason, "Collapsing into existing firing");
                }
            }
            session.done.subscribe()
        };

        let report = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TriggerError::Abandoned(id.to_string()))?;
        (*report)
            .clone()
            .ok_or_else(|| TriggerError::Abandoned(id.to_string()))
    }

    /// Fire the sessions owned by processes reported as exited.
    pub fn watch_monitor(&self, mut events: broadcast::Receiver<MonitoringEvent>) -> JoinHandle<()> {
        let trigger = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.is_exit() => {
                        let reason = if event.state == ProcessState::Killed {
                            TriggerReason::OwnerKilled { pid: event.pid }
                        } else {
                            TriggerReason::OwnerExited { pid: event.pid }
                        };
                        trigger.fire_owned_by(event.pid, reason);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // An exit may have been among the skipped events.
                        warn!(skipped, "Monitor events lagged; re-checking session owners");
                        for (pid, _) in trigger.armed_owners() {
                            if !platform::process_alive(pid) {
                                trigger.fire_owned_by(pid, TriggerReason::OwnerExited { pid });
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Monitor event stream closed");
        })
    }

    fn armed_owners(&self) -> Vec<(u32, SessionId)> {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.state == SessionState::Armed)
            .filter_map(|(id, s)| s.owner_pid.map(|pid| (pid, *id)))
            .collect()
    }

    fn fire_owned_by(&self, pid: u32, reason: TriggerReason) {
        for (owner, id) in self.armed_owners() {
            if owner != pid {
                continue;
            }
            let trigger = self.clone();
            let reason = reason.clone();
            tokio::spawn(async move {
                if let Err(err) = trigger.fire(id, reason).await {
                    warn!(session = %id, error = %err, "Owner-exit firing failed");
                }
            });
        }
    }

    /// Fire every armed session with `reason` and wait for their reports.
    pub async fn fire_armed(&self, reason: TriggerReason) -> Vec<SessionReport> {
        let armed: Vec<SessionId> = self
            .sessions()
            .into_iter()
            .filter(|(_, state)| *state == SessionState::Armed)
            .map(|(id, _)| id)
            .collect();
        if !armed.is_empty() {
            info!(sessions = armed.len(), reason = %reason, "Firing armed sessions");
        }
        let firings = armed.into_iter().map(|id| {
            let reason = reason.clone();
            async move { (id, self.fire(id, reason).await) }
        });
        join_all(firings)
            .await
            .into_iter()
            .filter_map(|(id, fired)| match fired {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!(session = %id, error = %err, "Armed session did not fire");
                    None
                }
            })
            .collect()
    }

    /// Host is shutting down: fire every live session and return within the
    /// shutdown deadline, reporting sessions that did not finish as failed.
    pub async fn on_host_shutdown(&self) -> Vec<SessionReport> {
        let deadline = Instant::now() + self.inner.settings.shutdown_deadline;
        self.inner.manager.begin_shutdown(deadline);
        warn!(
            deadline_ms = self.inner.settings.shutdown_deadline.as_millis() as u64,
            "Host shutdown: firing all sessions"
        );

        let live: Vec<SessionId> = self
            .sessions()
            .into_iter()
            .filter(|(_, state)| matches!(state, SessionState::Armed | SessionState::Firing))
            .map(|(id, _)| id)
            .collect();

        let firings = live.into_iter().map(|id| async move {
            match timeout_at(deadline, self.fire(id, TriggerReason::HostShutdown)).await {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    warn!(session = %id, error = %err, "Shutdown firing failed");
                    SessionReport::deadline_missed(id, TriggerReason::HostShutdown)
                }
                Err(_) => {
                    error!(session = %id, "Session cleanup missed the shutdown deadline");
                    SessionReport::deadline_missed(id, TriggerReason::HostShutdown)
                }
            }
        });
        let (reports, leftovers) = tokio::join!(join_all(firings), async {
            timeout_at(deadline, self.inner.manager.request_cleanup_all()).await
        });
        if leftovers.is_err() {
            error!("Registry-wide cleanup missed the shutdown deadline");
        }
        reports
    }

    /// Synchronous cleanup of every live session and registered target, for
    /// the panic hook. Bounded by the shutdown deadline.
    pub fn fire_all_blocking(&self, reason: TriggerReason) -> CleanupResult {
        let deadline = self.inner.settings.shutdown_deadline;
        let mut targets = self.inner.registry.all_targets();
        let mut fired = Vec::new();

        // The panicking thread may hold the lock.
        if let Some(mut sessions) = self.inner.sessions.try_lock_for(deadline / 4) {
            for (id, session) in sessions.iter_mut() {
                if session.current_state() == SessionState::Armed {
                    session.state = SessionState::Firing;
                    targets.extend(session.targets.iter().cloned());
                    fired.push((*id, session.done.clone()));
                }
            }
        } else {
            warn!("Session table busy; cleaning registered targets only");
        }

        let result = self.inner.manager.cleanup_blocking(targets, deadline);
        for (id, done) in fired {
            self.inner.complete(
                id,
                &done,
                SessionReport {
                    session: id,
                    reason: reason.clone(),
                    cleanup: result.clone(),
                    validation: None,
                    reattempt: None,
                    revalidation: None,
                    completed_at: Utc::now(),
                },
            );
        }
        result
    }

    fn audit(&self, record: AuditRecord) {
        self.inner.audit(record);
    }
}

impl TriggerInner {
    fn audit(&self, record: AuditRecord) {
        if let Err(err) = self.auditor.record(record) {
            warn!(error = %err, "Failed to record trigger audit entry");
        }
    }

    /// Deliver `report` to every waiter, then update the session table.
    /// Delivery never depends on getting the table lock.
    fn complete(&self, id: SessionId, done: &watch::Sender<Option<SessionReport>>, report: SessionReport) {
        let clean = report.is_clean();
        done.send_replace(Some(report));

        let Some(mut sessions) = self.sessions.try_lock_for(Duration::from_millis(500)) else {
            warn!(session = %id, "Session table busy; completion recorded on the report only");
            return;
        };
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        session.state = SessionState::Completed;
        session.timer = None;
        let targets = std::mem::take(&mut session.targets);

        if clean {
            let keep: HashSet<CleanupTarget> = sessions
                .iter()
                .filter(|(other, s)| **other != id && s.current_state() != SessionState::Completed)
                .flat_map(|(_, s)| s.targets.iter().flat_map(CleanupTarget::flatten))
                .collect();
            self.registry.release(&targets, &keep);
        }

        let mut retired = self.retired.lock();
        retired.push_back(id);
        while retired.len() > COMPLETED_RETAINED {
            if let Some(oldest) = retired.pop_front() {
                sessions.remove(&oldest);
                debug!(session = %oldest, "Completed session evicted");
            }
        }
    }
}

async fn run_session(
    inner: &TriggerInner,
    id: SessionId,
    reason: TriggerReason,
    targets: Vec<CleanupTarget>,
) -> SessionReport {
    let composite = CleanupTarget::Composite(targets);
    let checked = composite.flatten();
    inner.bus.publish(GuardNotification::CleanupStarted {
        session: id.to_string(),
        reason: reason.clone(),
        targets: checked.len(),
    });
    inner.audit(
        AuditRecord::new(AuditEventType::TriggerFired, ACTOR)
            .severity(reason.severity())
            .detail("session", id)
            .detail("reason", &reason),
    );

    let operation = inner
        .manager
        .operation(composite)
        .with_priority(CleanupPriority::Critical)
        .with_context("session", id.to_string())
        .with_context("reason", reason.to_string());
    let cleanup = inner.manager.request_cleanup(operation).await;

    let mut report = SessionReport {
        session: id,
        reason: reason.clone(),
        cleanup,
        validation: None,
        reattempt: None,
        revalidation: None,
        completed_at: Utc::now(),
    };

    if reason.skips_validation() {
        debug!(session = %id, "Validation skipped on shutdown path");
    } else {
        let session = id.to_string();
        let validation = inner.validator.validate_session(&session, ValidationScope::All, &checked);

        if !validation.passed {
            error!(
                session = %id,
                findings = validation.findings.len(),
                "Residual sensitive data after cleanup; re-attempting"
            );
            let mut remedial: Vec<CleanupTarget> = validation
                .findings
                .iter()
                .filter_map(|finding| finding.remediation(&inner.registry))
                .collect();
            remedial.dedup();
            let operation = inner
                .manager
                .operation(CleanupTarget::Composite(remedial))
                .with_priority(CleanupPriority::Critical)
                .with_context("session", id.to_string())
                .with_context("reattempt", "validation");
            report.reattempt = Some(inner.manager.request_cleanup(operation).await);

            let revalidation = inner.validator.validate_session(&session, ValidationScope::All, &checked);
            report.revalidation = Some(revalidation);
        }
        report.validation = Some(validation);
    }

    let last = report.final_cleanup();
    let status = if report.is_clean() {
        CleanupStatus::Success
    } else if last.status == CleanupStatus::Success {
        CleanupStatus::PartialSuccess
    } else {
        last.status
    };
    inner.bus.publish(GuardNotification::CleanupCompleted {
        session: id.to_string(),
        status,
        succeeded: last.succeeded(),
        failed: last.failed(),
        duration_ms: report.cleanup.duration.as_millis() as u64,
    });
    inner.audit(
        AuditRecord::new(AuditEventType::CleanupCompleted, ACTOR)
            .outcome(audit_outcome(status))
            .severity(if status == CleanupStatus::Success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Critical
            })
            .detail("session", id),
    );
    info!(session = %id, ?status, "Session cleanup finished");

    report.completed_at = Utc::now();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::cleanup::executor::{ExecOutcome, SystemExecutor, TargetExecutor};
    use crate::cleanup::manager::ManagerSettings;
    use crate::core::models::{EventKind, EventSource};
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn trigger() -> (CleanupTrigger, NotificationBus) {
        trigger_with(|registry| Arc::new(SystemExecutor::new(registry, Duration::from_millis(100))))
    }

    fn trigger_with(
        executor: impl FnOnce(Arc<SensitiveRegistry>) -> Arc<dyn TargetExecutor>,
    ) -> (CleanupTrigger, NotificationBus) {
        let bus = NotificationBus::default();
        let registry = Arc::new(SensitiveRegistry::new());
        let auditor = Arc::new(SecurityAuditor::in_memory(bus.clone()));
        let manager = Arc::new(CleanupManager::new(
            ManagerSettings::default(),
            executor(registry.clone()),
            registry.clone(),
            auditor.clone(),
        ));
        let validator = Arc::new(CleanupValidator::new(registry, auditor.clone(), bus.clone()));
        (
            CleanupTrigger::new(
                TriggerSettings {
                    shutdown_deadline: Duration::from_secs(2),
                },
                manager,
                validator,
                auditor,
                bus.clone(),
            ),
            bus,
        )
    }

    /// Reports the first environment variable as cleaned without touching it.
    struct SkipsFirstVariable {
        inner: SystemExecutor,
        skipped: AtomicBool,
    }

    impl TargetExecutor for SkipsFirstVariable {
        fn execute(&self, target: &CleanupTarget) -> Result<ExecOutcome, CleanupError> {
            if matches!(target, CleanupTarget::EnvironmentVariable(_)) && !self.skipped.swap(true, Ordering::SeqCst) {
                return Ok(ExecOutcome::Cleaned);
            }
            self.inner.execute(target)
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn succeeded() -> CleanupResult {
        CleanupResult::from_outcomes(Uuid::new_v4(), Vec::new(), Duration::ZERO)
    }

    fn failed() -> CleanupResult {
        CleanupResult::rejected(Uuid::new_v4(), "boom")
    }

    fn secret(value: &str) -> Arc<SecureHandle> {
        Arc::new(SecureHandle::from_string("token", value.to_string()).unwrap())
    }

    #[tokio::test]
    async fn idle_session_cannot_fire() {
        let (trigger, _) = trigger();
        let id = trigger.open_session(None, None);
        assert_eq!(trigger.state(id), Some(SessionState::Idle));
        assert!(matches!(
            trigger.fire(id, TriggerReason::Manual).await,
            Err(TriggerError::NotArmed(_))
        ));
        assert!(trigger.discard_idle(id));
        assert_eq!(trigger.state(id), None);
    }

    #[tokio::test]
    async fn attaching_arms_and_firing_completes() {
        let (trigger, _) = trigger();
        let id = trigger.open_session(Some(4242), None);
        let handle = secret("tok_abc123");
        trigger
            .attach_secret(id, handle.clone(), SecretMetadata::default())
            .unwrap();
        assert_eq!(trigger.state(id), Some(SessionState::Armed));

        let report = trigger.fire(id, TriggerReason::Manual).await.unwrap();
        assert!(report.is_clean());
        assert!(handle.is_wiped());
        assert_eq!(trigger.state(id), Some(SessionState::Completed));
        assert!(matches!(
            trigger.attach_process(id, 1),
            Err(TriggerError::AlreadyFired(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_firings_collapse() {
        let (trigger, bus) = trigger();
        let mut notifications = bus.subscribe();
        let id = trigger.open_session(Some(4242), None);
        trigger
            .attach_secret(id, secret("tok_abc123"), SecretMetadata::default())
            .unwrap();

        let (a, b, c) = tokio::join!(
            trigger.fire(id, TriggerReason::OwnerExited { pid: 4242 }),
            trigger.fire(id, TriggerReason::Timeout),
            trigger.fire(id, TriggerReason::Manual),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a, b);
        assert_eq!(b, c);

        let mut started = 0;
        while let Ok(notification) = notifications.try_recv() {
            if matches!(notification, GuardNotification::CleanupStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn timeout_fires_armed_session() {
        let (trigger, _) = trigger();
        let id = trigger.open_session(None, Some(Duration::from_millis(30)));
        let handle = secret("tok_timeout");
        trigger
            .attach_secret(id, handle.clone(), SecretMetadata::default())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = trigger.report(id).expect("timeout should have fired");
        assert_eq!(report.reason, TriggerReason::Timeout);
        assert!(handle.is_wiped());
    }

    #[tokio::test]
    #[serial]
    async fn owner_exit_event_fires_session() {
        let (trigger, _) = trigger();
        let (tx, rx) = broadcast::channel(16);
        let watcher = trigger.watch_monitor(rx);

        std::env::set_var("WARDEN_TEST_TRIGGER_TOKEN", "tok_abc123");
        let id = trigger.open_session(Some(4242), None);
        trigger
            .attach_environment_variable(id, "WARDEN_TEST_TRIGGER_TOKEN")
            .unwrap();

        let exit = MonitoringEvent::new(
            EventKind::ProcessExited,
            4242,
            ProcessState::Killed,
            EventSource::Push,
            Utc::now(),
            Duration::from_secs(2),
        );
        tx.send(exit).unwrap();

        let mut report = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            report = trigger.report(id);
            if report.is_some() {
                break;
            }
        }
        let report = report.expect("owner exit should fire the session");
        assert_eq!(report.reason, TriggerReason::OwnerKilled { pid: 4242 });
        assert!(std::env::var_os("WARDEN_TEST_TRIGGER_TOKEN").is_none());
        assert!(report.validation.as_ref().is_some_and(|v| v.passed));
        watcher.abort();
    }

    #[tokio::test]
    async fn host_shutdown_reports_every_live_session() {
        let (trigger, _) = trigger();
        let first = trigger.open_session(None, None);
        let second = trigger.open_session(None, None);
        let idle = trigger.open_session(None, None);
        trigger
            .attach_secret(first, secret("tok_one"), SecretMetadata::default())
            .unwrap();
        trigger
            .attach_secret(second, secret("tok_two"), SecretMetadata::default())
            .unwrap();

        let reports = trigger.on_host_shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.validation.is_none()));
        assert_eq!(trigger.state(idle), Some(SessionState::Idle));
    }

    #[test]
    fn blocking_fire_wipes_without_runtime() {
        let (trigger, _) = trigger();
        let id = trigger.open_session(None, None);
        let handle = secret("tok_panic");
        trigger
            .attach_secret(id, handle.clone(), SecretMetadata::default())
            .unwrap();

        let result = trigger.fire_all_blocking(TriggerReason::Panic);
        assert!(result.success);
        assert!(handle.is_wiped());
        assert_eq!(trigger.state(id), Some(SessionState::Completed));
    }

    #[tokio::test]
    #[serial]
    async fn residue_after_cleanup_is_reattempted_and_rechecked() {
        let (trigger, _) = trigger_with(|registry| {
            Arc::new(SkipsFirstVariable {
                inner: SystemExecutor::new(registry, Duration::from_millis(100)),
                skipped: AtomicBool::new(false),
            })
        });
        std::env::set_var("WARDEN_TEST_TRIGGER_STUBBORN", "tok_stubborn");
        let id = trigger.open_session(None, None);
        trigger
            .attach_environment_variable(id, "WARDEN_TEST_TRIGGER_STUBBORN")
            .unwrap();

        let report = trigger.fire(id, TriggerReason::Manual).await.unwrap();
        assert!(report.validation.as_ref().is_some_and(|v| !v.passed));
        assert!(report.reattempt.as_ref().is_some_and(|r| r.success));
        assert!(report.revalidation.as_ref().is_some_and(|v| v.passed));
        assert!(report.is_clean());
        assert!(std::env::var_os("WARDEN_TEST_TRIGGER_STUBBORN").is_none());

        let failed = trigger.inner.auditor.query(&AuditFilter {
            event_type: Some(AuditEventType::ValidationFailed),
            ..AuditFilter::default()
        });
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].severity, AuditSeverity::Critical);
        assert_eq!(
            failed[0].details.get("session").map(String::as_str),
            Some(id.to_string().as_str())
        );
        let passed = trigger.inner.auditor.query(&AuditFilter {
            event_type: Some(AuditEventType::ValidationCompleted),
            ..AuditFilter::default()
        });
        assert_eq!(passed.len(), 1);
    }

    #[test]
    fn failed_reattempt_is_not_clean() {
        let id = SessionId::new();
        let mut report = SessionReport {
            cleanup: failed(),
            ..SessionReport::deadline_missed(id, TriggerReason::Manual)
        };
        assert!(!report.is_clean());

        report.reattempt = Some(failed());
        assert!(!report.is_clean());

        report.reattempt = Some(succeeded());
        assert!(report.is_clean());

        report.cleanup = succeeded();
        report.reattempt = None;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn report_reaches_waiters_while_table_is_busy() {
        let (trigger, _) = trigger();
        let id = trigger.open_session(None, None);
        trigger
            .attach_secret(id, secret("tok_busy"), SecretMetadata::default())
            .unwrap();
        let done = trigger.inner.sessions.lock()[&id].done.clone();
        let waiter = done.subscribe();

        {
            let _busy = trigger.inner.sessions.lock();
            trigger
                .inner
                .complete(id, &done, SessionReport::deadline_missed(id, TriggerReason::Manual));
            assert!(waiter.borrow().is_some());
        }

        assert_eq!(trigger.state(id), Some(SessionState::Completed));
        let report = trigger.fire(id, TriggerReason::Timeout).await.unwrap();
        assert_eq!(report.reason, TriggerReason::Manual);
    }

    #[tokio::test]
    async fn completed_sessions_are_evicted_and_released() {
        let (trigger, _) = trigger();
        let registry = trigger.inner.registry.clone();
        let mut first = None;
        for n in 0..COMPLETED_RETAINED + 8 {
            let id = trigger.open_session(None, None);
            trigger
                .attach_secret(id, secret(&format!("tok_{n}")), SecretMetadata::default())
                .unwrap();
            assert!(trigger.fire(id, TriggerReason::Manual).await.unwrap().is_clean());
            first.get_or_insert(id);
        }

        assert!(eventually(|| trigger.sessions().len() == COMPLETED_RETAINED).await);
        assert!(eventually(|| registry.is_empty()).await);
        assert_eq!(trigger.state(first.unwrap()), None);
    }

    #[tokio::test]
    async fn release_keeps_targets_of_live_sessions() {
        let (trigger, _) = trigger();
        let registry = trigger.inner.registry.clone();
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.json");

        let finished = trigger.open_session(None, None);
        let live = trigger.open_session(None, None);
        trigger.attach_transient_file(finished, shared.clone()).unwrap();
        trigger.attach_transient_file(live, shared.clone()).unwrap();

        assert!(trigger.fire(finished, TriggerReason::Manual).await.unwrap().is_clean());
        assert!(eventually(|| trigger.inner.retired.lock().contains(&finished)).await);
        assert_eq!(registry.transient_files(), vec![shared]);
    }

    #[tokio::test]
    async fn stop_fires_only_armed_sessions() {
        let (trigger, _) = trigger();
        let armed = trigger.open_session(None, None);
        let idle = trigger.open_session(None, None);
        let handle = secret("tok_stopping");
        trigger
            .attach_secret(armed, handle.clone(), SecretMetadata::default())
            .unwrap();

        let reports = trigger.fire_armed(TriggerReason::Stopped).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].session, armed);
        assert_eq!(reports[0].reason, TriggerReason::Stopped);
        assert!(handle.is_wiped());
        assert_eq!(trigger.state(idle), Some(SessionState::Idle));
        assert!(!trigger.discard_idle(armed));
    }
}
