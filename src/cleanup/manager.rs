//! Cleanup orchestration: admission gate, retries, per-attempt timeouts and
//! the shutdown deadline.
//!
//! Every call to [`CleanupManager::request_cleanup`] yields exactly one
//! [`CleanupResult`]. Operations beyond the concurrency cap wait at the gate;
//! once a shutdown deadline is set, waiting and retrying are bounded by it and
//! anything that cannot finish in time is reported failed instead of pending.

use crate::audit::{AuditEventType, AuditOutcome, AuditRecord, AuditSeverity, SecurityAuditor};
use crate::cleanup::executor::{ExecOutcome, TargetExecutor};
use crate::cleanup::operation::{
    CleanupOperation, CleanupPriority, CleanupResult, CleanupStatus, CleanupTarget, RetryPolicy,
    TargetOutcome, TargetStatus,
};
use crate::cleanup::registry::SensitiveRegistry;
use crate::config::GuardConfig;
use crate::error::CleanupError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ACTOR: &str = "cleanup-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    pub concurrency: usize,
    pub operation_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ManagerSettings {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            concurrency: config.cleanup_concurrency,
            operation_timeout: config.operation_timeout(),
            retry: RetryPolicy::new(config.retry_max, config.retry_backoff()),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

type SharedResult = watch::Receiver<Option<CleanupResult>>;

enum Role {
    Leader(watch::Sender<Option<CleanupResult>>),
    Follower(SharedResult),
}

/// Removes the in-flight entry of a leader, including when its future is
/// dropped before finishing.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, (Uuid, SharedResult)>,
    identity: String,
    leader: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.identity, |_, (leader, _)| *leader == self.leader);
    }
}

struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CleanupManager {
    settings: ManagerSettings,
    executor: Arc<dyn TargetExecutor>,
    registry: Arc<SensitiveRegistry>,
    auditor: Arc<SecurityAuditor>,
    gate: Arc<Semaphore>,
    waiting: AtomicUsize,
    in_flight: DashMap<String, (Uuid, SharedResult)>,
    deadline: watch::Sender<Option<Instant>>,
}

impl CleanupManager {
    pub fn new(
        settings: ManagerSettings,
        executor: Arc<dyn TargetExecutor>,
        registry: Arc<SensitiveRegistry>,
        auditor: Arc<SecurityAuditor>,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        let (deadline, _) = watch::channel(None);
        Self {
            settings: ManagerSettings {
                concurrency,
                ..settings
            },
            executor,
            registry,
            auditor,
            gate: Arc::new(Semaphore::new(concurrency)),
            waiting: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            deadline,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SensitiveRegistry> {
        &self.registry
    }

    /// Operation for `target` carrying the configured retry policy.
    pub fn operation(&self, target: CleanupTarget) -> CleanupOperation {
        CleanupOperation::new(target).with_retry(self.settings.retry)
    }

    /// Operations currently holding an admission permit.
    pub fn running(&self) -> usize {
        self.settings.concurrency - self.gate.available_permits()
    }

    /// Operations waiting at the admission gate.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Distinct target sets currently being cleaned.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Bound all current and future work by `deadline`. An earlier deadline
    /// already in place is kept.
    pub fn begin_shutdown(&self, deadline: Instant) {
        self.deadline.send_if_modified(|current| match current {
            Some(existing) if *existing <= deadline => false,
            _ => {
                *current = Some(deadline);
                true
            }
        });
        info!(
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Cleanup manager entering shutdown"
        );
    }

    pub fn shutdown_deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    /// Execute one operation. A request whose target set is already being
    /// cleaned waits for that run and returns its outcome instead of running
    /// the targets again.
    pub async fn request_cleanup(&self, operation: CleanupOperation) -> CleanupResult {
        let identity = operation.target.identity();
        loop {
            let role = match self.in_flight.entry(identity.clone()) {
                Entry::Occupied(entry) => Role::Follower(entry.get().1.clone()),
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert((operation.id, rx));
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        map: &self.in_flight,
                        identity,
                        leader: operation.id,
                    };
                    let result = self.execute(operation).await;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    debug!(operation = %operation.id, "Joining in-flight cleanup of the same targets");
                    let shared = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|value| (*value).clone());
                    match shared {
                        Some(leader) => {
                            self.audit(
                                AuditRecord::new(AuditEventType::CleanupCompleted, ACTOR)
                                    .outcome(audit_outcome(leader.status))
                                    .detail("operation", operation.id)
                                    .detail("shared_with", leader.operation_id),
                            );
                            return CleanupResult {
                                operation_id: operation.id,
                                shared_with: Some(leader.operation_id),
                                ..leader
                            };
                        }
                        // The leader was dropped without reporting; run it ourselves.
                        None => continue,
                    }
                }
            }
        }
    }

    /// Erase everything currently registered.
    pub async fn request_cleanup_all(&self) -> CleanupResult {
        let operation = self
            .operation(CleanupTarget::Composite(self.registry.all_targets()))
            .with_priority(CleanupPriority::Critical)
            .with_context("scope", "all");
        self.request_cleanup(operation).await
    }

    async fn execute(&self, operation: CleanupOperation) -> CleanupResult {
        let started = StdInstant::now();
        let leaves = operation.target.flatten();
        info!(
            operation = %operation.id,
            targets = leaves.len(),
            priority = ?operation.priority,
            "Cleanup requested"
        );
        self.audit_request(&operation, &leaves);

        let permit = {
            let _waiting = Waiting::enter(&self.waiting);
            self.admit().await
        };

        let outcomes = match permit {
            Some(_permit) => {
                join_all(leaves.iter().map(|leaf| self.run_target(leaf, &operation))).await
            }
            None => {
                warn!(operation = %operation.id, "Shutdown deadline reached before admission");
                leaves
                    .into_iter()
                    .map(|target| TargetOutcome {
                        target,
                        status: TargetStatus::TimedOut,
                        attempts: 0,
                        error: Some(CleanupError::DeadlineExceeded.to_string()),
                    })
                    .collect()
            }
        };

        let result = CleanupResult::from_outcomes(operation.id, outcomes, started.elapsed());
        match result.status {
            CleanupStatus::Success => info!(
                operation = %operation.id,
                duration_ms = result.duration.as_millis() as u64,
                "Cleanup completed"
            ),
            _ => warn!(
                operation = %operation.id,
                succeeded = result.succeeded(),
                failed = result.failed(),
                "Cleanup finished with failures"
            ),
        }
        self.audit_result(&operation, &result);
        result
    }

    /// Wait for a permit, giving up at the shutdown deadline.
    async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            permit = self.gate.clone().acquire_owned() => permit.ok(),
            _ = self.deadline_reached() => None,
        }
    }

    /// Resolves once a shutdown deadline is set and has passed.
    async fn deadline_reached(&self) {
        let mut deadline_rx = self.deadline.subscribe();
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                _ = wait_until(deadline) => return,
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: no deadline can be set any more.
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .borrow()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    async fn run_target(&self, target: &CleanupTarget, operation: &CleanupOperation) -> TargetOutcome {
        let max_attempts = operation.retry.max_attempts();
        let mut attempts = 0;
        let mut last_error = CleanupError::DeadlineExceeded;

        while attempts < max_attempts {
            let budget = match self.remaining() {
                Some(remaining) if remaining.is_zero() => {
                    last_error = CleanupError::DeadlineExceeded;
                    break;
                }
                Some(remaining) => remaining.min(self.settings.operation_timeout),
                None => self.settings.operation_timeout,
            };

            attempts += 1;
            match self.attempt(target, budget).await {
                Ok(outcome) => {
                    let status = match outcome {
                        ExecOutcome::Cleaned => TargetStatus::Succeeded,
                        ExecOutcome::AlreadyClean => TargetStatus::AlreadyClean,
                    };
                    debug!(target = %target, attempts, ?status, "Cleanup target done");
                    return TargetOutcome {
                        target: target.clone(),
                        status,
                        attempts,
                        error: None,
                    };
                }
                Err(err) => {
                    warn!(target = %target, attempt = attempts, error = %err, "Cleanup attempt failed");
                    // A timed-out attempt may still be running; only repeat it
                    // when the operation tolerates running twice.
                    let retryable = err.is_transient()
                        && (operation.idempotent || !matches!(err, CleanupError::Timeout { .. }));
                    last_error = err;
                    if !retryable || attempts >= max_attempts {
                        break;
                    }
                    let backoff = operation.retry.backoff(attempts);
                    if matches!(self.remaining(), Some(remaining) if remaining <= backoff) {
                        break;
                    }
                    sleep(backoff).await;
                }
            }
        }

        let status = match last_error {
            CleanupError::Timeout { .. } | CleanupError::DeadlineExceeded => TargetStatus::TimedOut,
            _ => TargetStatus::Failed,
        };
        TargetOutcome {
            target: target.clone(),
            status,
            attempts,
            error: Some(last_error.to_string()),
        }
    }

    /// One attempt on a blocking thread. On timeout the thread is abandoned,
    /// not cancelled.
    async fn attempt(&self, target: &CleanupTarget, budget: Duration) -> Result<ExecOutcome, CleanupError> {
        let executor = self.executor.clone();
        let leaf = target.clone();
        let task = tokio::task::spawn_blocking(move || executor.execute(&leaf));
        tokio::select! {
            joined = timeout(budget, task) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(CleanupError::Worker(join.to_string())),
                Err(_) => Err(CleanupError::Timeout {
                    timeout_ms: budget.as_millis() as u64,
                }),
            },
            _ = self.deadline_reached() => Err(CleanupError::DeadlineExceeded),
        }
    }

    /// Synchronous best-effort cleanup for contexts that cannot await, such
    /// as a panic hook. Targets run in order on the calling thread until
    /// `budget` is spent.
    pub fn cleanup_blocking(&self, targets: Vec<CleanupTarget>, budget: Duration) -> CleanupResult {
        let started = StdInstant::now();
        let operation = self
            .operation(CleanupTarget::Composite(targets))
            .with_priority(CleanupPriority::Critical)
            .with_context("mode", "blocking");
        let leaves = operation.target.flatten();
        self.audit_request(&operation, &leaves);

        let mut outcomes = Vec::with_capacity(leaves.len());
        for target in leaves {
            let mut attempts = 0;
            let mut outcome = None;
            let mut last_error = CleanupError::DeadlineExceeded;
            while attempts < operation.retry.max_attempts() && started.elapsed() < budget {
                attempts += 1;
                match self.executor.execute(&target) {
                    Ok(ExecOutcome::Cleaned) => outcome = Some(TargetStatus::Succeeded),
                    Ok(ExecOutcome::AlreadyClean) => outcome = Some(TargetStatus::AlreadyClean),
                    Err(err) => {
                        let retryable = err.is_transient();
                        last_error = err;
                        if retryable {
                            let backoff = operation.retry.backoff(attempts);
                            if started.elapsed() + backoff < budget {
                                std::thread::sleep(backoff);
                                continue;
                            }
                        }
                        break;
                    }
                }
                if outcome.is_some() {
                    break;
                }
            }
            outcomes.push(match outcome {
                Some(status) => TargetOutcome {
                    target,
                    status,
                    attempts,
                    error: None,
                },
                None => TargetOutcome {
                    status: match last_error {
                        CleanupError::DeadlineExceeded => TargetStatus::TimedOut,
                        _ => TargetStatus::Failed,
                    },
                    target,
                    attempts,
                    error: Some(last_error.to_string()),
                },
            });
        }

        let result = CleanupResult::from_outcomes(operation.id, outcomes, started.elapsed());
        self.audit_result(&operation, &result);
        result
    }

    fn audit_request(&self, operation: &CleanupOperation, leaves: &[CleanupTarget]) {
        let targets: Vec<String> = leaves.iter().map(|t| t.to_string()).collect();
        let mut record = AuditRecord::new(AuditEventType::CleanupRequested, ACTOR)
            .detail("operation", operation.id)
            .detail("priority", format!("{:?}", operation.priority))
            .detail("targets", targets.join(","));
        for (key, value) in &operation.context {
            record = record.detail(format!("context.{}", key), value);
        }
        self.audit(record);
    }

    fn audit_result(&self, operation: &CleanupOperation, result: &CleanupResult) {
        let severity = match result.status {
            CleanupStatus::Success => AuditSeverity::Info,
            CleanupStatus::PartialSuccess => AuditSeverity::Warning,
            CleanupStatus::Failure => AuditSeverity::Critical,
        };
        let mut record = AuditRecord::new(AuditEventType::CleanupCompleted, ACTOR)
            .outcome(audit_outcome(result.status))
            .severity(severity)
            .detail("operation", operation.id)
            .detail("succeeded", result.succeeded())
            .detail("failed", result.failed())
            .detail("duration_ms", result.duration.as_millis());
        if let Some(error) = &result.error {
            record = record.detail("error", error);
        }
        self.audit(record);
    }

    fn audit(&self, record: AuditRecord) {
        if let Err(err) = self.auditor.record(record) {
            warn!(error = %err, "Failed to record cleanup audit entry");
        }
    }
}

pub(crate) fn audit_outcome(status: CleanupStatus) -> AuditOutcome {
    match status {
        CleanupStatus::Success => AuditOutcome::Success,
        CleanupStatus::PartialSuccess => AuditOutcome::PartialSuccess,
        CleanupStatus::Failure => AuditOutcome::Failure,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::events::NotificationBus;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Executor whose behavior per target is scripted by the test.
    #[derive(Default)]
    struct ScriptedExecutor {
        failures: Mutex<HashMap<String, u32>>,
        permanent: Mutex<Vec<String>>,
        delay: Option<Duration>,
        calls: Mutex<HashMap<String, u32>>,
        active: AtomicU32,
        peak: AtomicU32,
    }

    impl ScriptedExecutor {
        fn fail_times(self, target: &CleanupTarget, times: u32) -> Self {
            self.failures.lock().insert(target.to_string(), times);
            self
        }

        fn fail_always(self, target: &CleanupTarget) -> Self {
            self.permanent.lock().push(target.to_string());
            self
        }

        fn calls(&self, target: &CleanupTarget) -> u32 {
            self.calls.lock().get(&target.to_string()).copied().unwrap_or(0)
        }
    }

    impl TargetExecutor for ScriptedExecutor {
        fn execute(&self, target: &CleanupTarget) -> Result<ExecOutcome, CleanupError> {
            let key = target.to_string();
            *self.calls.lock().entry(key.clone()).or_insert(0) += 1;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.permanent.lock().contains(&key) {
                return Err(CleanupError::Busy {
                    target: key,
                    message: "locked".into(),
                });
            }
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CleanupError::AccessDenied {
                        target: key,
                        message: "race".into(),
                    });
                }
            }
            Ok(ExecOutcome::Cleaned)
        }
    }

    fn manager(executor: Arc<ScriptedExecutor>, concurrency: usize) -> CleanupManager {
        CleanupManager::new(
            ManagerSettings {
                concurrency,
                operation_timeout: Duration::from_millis(500),
                retry: RetryPolicy::new(2, Duration::from_millis(5)),
            },
            executor,
            Arc::new(SensitiveRegistry::new()),
            Arc::new(SecurityAuditor::in_memory(NotificationBus::default())),
        )
    }

    fn env(name: &str) -> CleanupTarget {
        CleanupTarget::EnvironmentVariable(name.to_string())
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let target = env("A");
        let executor = Arc::new(ScriptedExecutor::default().fail_times(&target, 2));
        let manager = manager(executor.clone(), 3);

        let result = manager.request_cleanup(manager.operation(target.clone())).await;
        assert!(result.success);
        assert_eq!(result.outcomes[0].attempts, 3);
        assert_eq!(executor.calls(&target), 3);
    }

    #[tokio::test]
    async fn composite_reports_each_failed_target() {
        let bad = env("BAD");
        let flaky = env("FLAKY");
        let good = env("GOOD");
        let executor = Arc::new(
            ScriptedExecutor::default()
                .fail_always(&bad)
                .fail_times(&flaky, 1),
        );
        let manager = manager(executor.clone(), 3);

        let operation = manager.operation(CleanupTarget::Composite(vec![
            bad.clone(),
            flaky.clone(),
            good.clone(),
        ]));
        let result = manager.request_cleanup(operation).await;

        assert_eq!(result.status, CleanupStatus::PartialSuccess);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(executor.calls(&bad), 3);
        assert_eq!(executor.calls(&flaky), 2);
        assert_eq!(executor.calls(&good), 1);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        struct Invalid;
        impl TargetExecutor for Invalid {
            fn execute(&self, _: &CleanupTarget) -> Result<ExecOutcome, CleanupError> {
                Err(CleanupError::InvalidTarget("bad".into()))
            }
        }
        let manager = CleanupManager::new(
            ManagerSettings::default(),
            Arc::new(Invalid),
            Arc::new(SensitiveRegistry::new()),
            Arc::new(SecurityAuditor::in_memory(NotificationBus::default())),
        );
        let result = manager.request_cleanup(manager.operation(env("X"))).await;
        assert_eq!(result.status, CleanupStatus::Failure);
        assert_eq!(result.outcomes[0].attempts, 1);
        assert_eq!(result.outcomes[0].status, TargetStatus::Failed);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let executor = Arc::new(ScriptedExecutor {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedExecutor::default()
        });
        let manager = Arc::new(manager(executor.clone(), 2));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .request_cleanup(manager.operation(env(&format!("VAR_{}", i))))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().success);
        }
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.queued(), 0);
        assert_eq!(manager.running(), 0);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_run() {
        let target = CleanupTarget::Process { pid: 4242 };
        let executor = Arc::new(ScriptedExecutor {
            delay: Some(Duration::from_millis(80)),
            ..ScriptedExecutor::default()
        });
        let manager = Arc::new(manager(executor.clone(), 3));

        let first = manager.operation(target.clone());
        let second = manager.operation(target.clone());
        let (a, b) = tokio::join!(manager.request_cleanup(first), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.request_cleanup(second).await
        });

        assert!(a.success && b.success);
        assert_eq!(executor.calls(&target), 1);
        assert_eq!(b.shared_with, Some(a.operation_id));
        assert_ne!(a.operation_id, b.operation_id);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn queued_work_fails_at_shutdown_deadline() {
        let executor = Arc::new(ScriptedExecutor {
            delay: Some(Duration::from_millis(300)),
            ..ScriptedExecutor::default()
        });
        let manager = Arc::new(manager(executor.clone(), 1));

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request_cleanup(manager.operation(env("SLOW"))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.begin_shutdown(Instant::now() + Duration::from_millis(100));

        let started = StdInstant::now();
        let queued = manager.request_cleanup(manager.operation(env("WAITING"))).await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(queued.outcomes[0].status, TargetStatus::TimedOut);
        assert_eq!(queued.outcomes[0].attempts, 0);

        let running = running.await.unwrap();
        assert_eq!(running.outcomes[0].status, TargetStatus::TimedOut);
    }

    #[tokio::test]
    async fn requests_and_results_are_audited() {
        let executor = Arc::new(ScriptedExecutor::default());
        let auditor = Arc::new(SecurityAuditor::in_memory(NotificationBus::default()));
        let manager = CleanupManager::new(
            ManagerSettings::default(),
            executor,
            Arc::new(SensitiveRegistry::new()),
            auditor.clone(),
        );
        manager.request_cleanup(manager.operation(env("A"))).await;

        let entries = auditor.query(&AuditFilter::default());
        let kinds: Vec<AuditEventType> = entries.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![AuditEventType::CleanupRequested, AuditEventType::CleanupCompleted]
        );
        assert!(auditor.verify_chain_integrity());
    }

    #[test]
    fn blocking_cleanup_respects_retry_budget() {
        let bad = env("BAD");
        let executor = Arc::new(ScriptedExecutor::default().fail_always(&bad));
        let manager = manager(executor.clone(), 3);
        let result = manager.cleanup_blocking(vec![bad.clone(), env("OK")], Duration::from_secs(1));
        assert_eq!(result.status, CleanupStatus::PartialSuccess);
        assert_eq!(executor.calls(&bad), 3);
    }
}
