//! Explicit wiring of every component, built once at startup and passed to
//! whoever needs it.

use crate::audit::SecurityAuditor;
use crate::cleanup::{
    CleanupManager, CleanupTrigger, CleanupValidator, ManagerSettings, SensitiveRegistry,
    SystemExecutor, TargetExecutor, TriggerReason, TriggerSettings,
};
use crate::config::GuardConfig;
use crate::error::WardenResult;
use crate::events::NotificationBus;
use crate::monitor::{platform_backend, EventBackend, MonitorMode, MonitorSettings, ProcessMonitor};
use crate::monitor::{ProcessProbe, SysinfoProbe};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct GuardContext {
    pub config: GuardConfig,
    pub bus: NotificationBus,
    pub registry: Arc<SensitiveRegistry>,
    pub auditor: Arc<SecurityAuditor>,
    pub manager: Arc<CleanupManager>,
    pub validator: Arc<CleanupValidator>,
    pub monitor: Arc<ProcessMonitor>,
    pub trigger: CleanupTrigger,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Overrides for the pieces that touch the operating system.
#[derive(Default)]
pub struct ContextBuilder {
    probe: Option<Box<dyn ProcessProbe>>,
    backend: Option<Arc<dyn EventBackend>>,
    executor: Option<Arc<dyn TargetExecutor>>,
    in_memory_audit: bool,
}

impl ContextBuilder {
    pub fn probe(mut self, probe: Box<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn EventBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TargetExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Keep the audit chain in memory regardless of `audit_log_path`.
    pub fn in_memory_audit(mut self) -> Self {
        self.in_memory_audit = true;
        self
    }

    pub fn build(self, config: GuardConfig) -> WardenResult<GuardContext> {
        config.validate()?;
        let bus = NotificationBus::default();

        let auditor = Arc::new(match (&config.audit_log_path, self.in_memory_audit) {
            (Some(path), false) => SecurityAuditor::open(path, bus.clone())?,
            _ => SecurityAuditor::in_memory(bus.clone()),
        });

        let registry = Arc::new(SensitiveRegistry::new());
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(SystemExecutor::new(registry.clone(), config.process_grace()))
        });
        let manager = Arc::new(CleanupManager::new(
            ManagerSettings::from_config(&config),
            executor,
            registry.clone(),
            auditor.clone(),
        ));
        let validator = Arc::new(CleanupValidator::new(
            registry.clone(),
            auditor.clone(),
            bus.clone(),
        ));
        let trigger = CleanupTrigger::new(
            TriggerSettings {
                shutdown_deadline: config.shutdown_deadline(),
            },
            manager.clone(),
            validator.clone(),
            auditor.clone(),
            bus.clone(),
        );

        let monitor = Arc::new(ProcessMonitor::new(
            MonitorSettings::from_config(&config)?,
            self.probe.unwrap_or_else(|| Box::new(SysinfoProbe::new())),
            self.backend.unwrap_or_else(platform_backend),
            bus.clone(),
        ));

        Ok(GuardContext {
            config,
            bus,
            registry,
            auditor,
            manager,
            validator,
            monitor,
            trigger,
            watcher: Mutex::new(None),
        })
    }
}

impl GuardContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context backed by the real process table and the platform push backend.
    pub fn new(config: GuardConfig) -> WardenResult<Self> {
        Self::builder().build(config)
    }

    /// Start monitoring and connect monitor exits to the cleanup trigger.
    pub fn start(&self) -> WardenResult<MonitorMode> {
        let mode = self.monitor.start()?;
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(self.trigger.watch_monitor(self.monitor.subscribe()));
        }
        info!(?mode, "Secret warden started");
        Ok(mode)
    }

    /// Clean every armed session, then stop monitoring.
    pub async fn stop(&self) {
        let reports = self.trigger.fire_armed(TriggerReason::Stopped).await;
        if reports.iter().any(|r| !r.is_clean()) {
            warn!(sessions = reports.len(), "Some sessions were not cleaned on stop");
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.monitor.stop().await;
        info!("Secret warden stopped");
    }
}
