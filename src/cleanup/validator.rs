//! Post-cleanup verification against the registered sensitive identifiers.
//!
//! The scan is targeted: it looks only at registered handles, variable
//! names, file paths, and environment values whose salted fingerprint
//! matches a registered secret. Findings name a location and a kind, never
//! the value. Every run is recorded in the audit trail.

use crate::audit::{AuditEventType, AuditOutcome, AuditRecord, AuditSeverity, SecurityAuditor};
use crate::cleanup::executor;
use crate::cleanup::operation::CleanupTarget;
use crate::cleanup::registry::SensitiveRegistry;
use crate::events::{GuardNotification, NotificationBus};
use crate::secure::HandleState;
use crate::utils::env;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    Memory,
    EnvironmentVariables,
    Files,
    All,
}

impl ValidationScope {
    fn covers(&self, scope: ValidationScope) -> bool {
        *self == ValidationScope::All || *self == scope
    }

    fn concrete(&self) -> Vec<ValidationScope> {
        match self {
            ValidationScope::All => vec![
                ValidationScope::Memory,
                ValidationScope::EnvironmentVariables,
                ValidationScope::Files,
            ],
            other => vec![*other],
        }
    }
}

impl fmt::Display for ValidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationScope::Memory => "memory",
            ValidationScope::EnvironmentVariables => "environment",
            ValidationScope::Files => "files",
            ValidationScope::All => "all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// A registered handle still holds its secret.
    HandleActive,
    /// A registered variable name is still set.
    VariablePresent,
    /// Another variable holds a value equal to a registered secret.
    SecretCopyInEnvironment,
    FilePresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub scope: ValidationScope,
    pub kind: FindingKind,
    /// Handle id, variable name or file path.
    pub location: String,
}

impl Finding {
    /// Cleanup target that would remove this residue.
    pub fn remediation(&self, registry: &SensitiveRegistry) -> Option<CleanupTarget> {
        match self.kind {
            FindingKind::HandleActive => registry
                .secrets()
                .into_iter()
                .find(|s| s.handle.id().to_string() == self.location)
                .map(|s| CleanupTarget::Memory(s.handle.id())),
            FindingKind::VariablePresent | FindingKind::SecretCopyInEnvironment => {
                Some(CleanupTarget::EnvironmentVariable(self.location.clone()))
            }
            FindingKind::FilePresent => Some(CleanupTarget::ConfigFile(self.location.clone().into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeVerdict {
    pub scope: ValidationScope,
    pub passed: bool,
    pub findings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub scope: ValidationScope,
    pub passed: bool,
    pub verdicts: Vec<ScopeVerdict>,
    pub findings: Vec<Finding>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationResult {
    fn from_findings(scope: ValidationScope, findings: Vec<Finding>) -> Self {
        let verdicts: Vec<ScopeVerdict> = scope
            .concrete()
            .into_iter()
            .map(|s| {
                let count = findings.iter().filter(|f| f.scope == s).count();
                ScopeVerdict {
                    scope: s,
                    passed: count == 0,
                    findings: count,
                }
            })
            .collect();
        Self {
            scope,
            passed: findings.is_empty(),
            verdicts,
            findings,
            checked_at: Utc::now(),
        }
    }

    pub fn passed_for(&self, scope: ValidationScope) -> bool {
        self.verdicts
            .iter()
            .filter(|v| scope.covers(v.scope))
            .all(|v| v.passed)
    }
}

/// What a validation run should look at.
#[derive(Debug, Default)]
struct Selection {
    all: bool,
    handles: BTreeSet<String>,
    variables: BTreeSet<String>,
    files: BTreeSet<std::path::PathBuf>,
}

impl Selection {
    fn from_targets(targets: &[CleanupTarget]) -> Self {
        let mut selection = Selection::default();
        for target in targets.iter().flat_map(|t| t.flatten()) {
            match target {
                CleanupTarget::Memory(id) => {
                    selection.handles.insert(id.to_string());
                }
                CleanupTarget::EnvironmentVariable(name) => {
                    selection.variables.insert(name);
                }
                CleanupTarget::ConfigFile(path) => {
                    selection.files.insert(path);
                }
                CleanupTarget::Process { .. } | CleanupTarget::Composite(_) => {}
            }
        }
        selection
    }
}

const ACTOR: &str = "cleanup-validator";

pub struct CleanupValidator {
    registry: Arc<SensitiveRegistry>,
    auditor: Arc<SecurityAuditor>,
    bus: NotificationBus,
}

impl CleanupValidator {
    pub fn new(registry: Arc<SensitiveRegistry>, auditor: Arc<SecurityAuditor>, bus: NotificationBus) -> Self {
        Self {
            registry,
            auditor,
            bus,
        }
    }

    /// Check every registered identifier within `scope`.
    pub fn validate(&self, scope: ValidationScope) -> ValidationResult {
        let result = self.run(
            scope,
            &Selection {
                all: true,
                ..Selection::default()
            },
        );
        self.record(&result, None);
        result
    }

    /// Check only the identifiers named by `targets`.
    pub fn validate_targets(&self, scope: ValidationScope, targets: &[CleanupTarget]) -> ValidationResult {
        let result = self.run(scope, &Selection::from_targets(targets));
        self.record(&result, None);
        result
    }

    /// [`validate_targets`](Self::validate_targets) on behalf of a cleanup session.
    pub(crate) fn validate_session(
        &self,
        session: &str,
        scope: ValidationScope,
        targets: &[CleanupTarget],
    ) -> ValidationResult {
        let result = self.run(scope, &Selection::from_targets(targets));
        self.record(&result, Some(session));
        result
    }

    fn record(&self, result: &ValidationResult, session: Option<&str>) {
        let event = if result.passed {
            AuditEventType::ValidationCompleted
        } else {
            AuditEventType::ValidationFailed
        };
        let mut record = AuditRecord::new(event, ACTOR)
            .detail("scope", result.scope)
            .detail("findings", result.findings.len());
        if let Some(session) = session {
            record = record.detail("session", session);
        }
        record = if result.passed {
            record.outcome(AuditOutcome::Passed)
        } else {
            let residue: Vec<String> = result
                .findings
                .iter()
                .map(|f| format!("{}:{:?}", f.scope, f.kind))
                .collect();
            record
                .outcome(AuditOutcome::Failed)
                .severity(AuditSeverity::Critical)
                .detail("residue", residue.join(","))
        };
        if let Err(err) = self.auditor.record(record) {
            warn!(error = %err, "Failed to record validation audit entry");
        }

        if !result.passed {
            self.bus.publish(GuardNotification::ValidationFailed {
                session: session.map(str::to_string),
                scope: result.scope,
                findings: result.findings.len(),
            });
        }
    }

    fn run(&self, scope: ValidationScope, selection: &Selection) -> ValidationResult {
        let mut findings = Vec::new();
        if scope.covers(ValidationScope::Memory) {
            self.scan_memory(selection, &mut findings);
        }
        if scope.covers(ValidationScope::EnvironmentVariables) {
            self.scan_environment(selection, &mut findings);
        }
        if scope.covers(ValidationScope::Files) {
            self.scan_files(selection, &mut findings);
        }

        let result = ValidationResult::from_findings(scope, findings);
        if result.passed {
            debug!(scope = %scope, "validation passed");
        } else {
            warn!(scope = %scope, findings = result.findings.len(), "residual sensitive data found");
        }
        result
    }

    fn scan_memory(&self, selection: &Selection, findings: &mut Vec<Finding>) {
        for secret in self.registry.secrets() {
            let location = secret.handle.id().to_string();
            if !selection.all && !selection.handles.contains(&location) {
                continue;
            }
            if secret.handle.state() == HandleState::Active {
                findings.push(Finding {
                    scope: ValidationScope::Memory,
                    kind: FindingKind::HandleActive,
                    location,
                });
            }
        }
    }

    fn scan_environment(&self, selection: &Selection, findings: &mut Vec<Finding>) {
        let names: Vec<String> = if selection.all {
            self.registry.environment_variables()
        } else {
            selection.variables.iter().cloned().collect()
        };
        for name in names {
            if env::is_set(&name) {
                findings.push(Finding {
                    scope: ValidationScope::EnvironmentVariables,
                    kind: FindingKind::VariablePresent,
                    location: name,
                });
            }
        }

        let secrets: Vec<_> = self
            .registry
            .secrets()
            .into_iter()
            .filter(|s| selection.all || selection.handles.contains(&s.handle.id().to_string()))
            .collect();
        if secrets.is_empty() {
            return;
        }
        for (name, value) in std::env::vars_os() {
            let name = name.to_string_lossy().into_owned();
            if findings.iter().any(|f| f.location == name) {
                continue;
            }
            let bytes = value.as_encoded_bytes();
            if secrets.iter().any(|s| s.handle.fingerprint().matches(bytes)) {
                findings.push(Finding {
                    scope: ValidationScope::EnvironmentVariables,
                    kind: FindingKind::SecretCopyInEnvironment,
                    location: name,
                });
            }
        }
    }

    fn scan_files(&self, selection: &Selection, findings: &mut Vec<Finding>) {
        let patterns: Vec<std::path::PathBuf> = if selection.all {
            self.registry.transient_files()
        } else {
            selection.files.iter().cloned().collect()
        };
        for pattern in patterns {
            let paths = match executor::expand(&pattern) {
                Ok(paths) => paths,
                Err(err) => {
                    warn!(pattern = %pattern.display(), error = %err, "cannot expand file pattern");
                    vec![pattern.clone()]
                }
            };
            for path in paths {
                if std::fs::symlink_metadata(&path).is_ok() {
                    findings.push(Finding {
                        scope: ValidationScope::Files,
                        kind: FindingKind::FilePresent,
                        location: path.display().to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::cleanup::registry::{SecretKind, SecretMetadata};
    use crate::secure::SecureHandle;
    use serial_test::serial;
    use tempfile::TempDir;

    fn validator(registry: Arc<SensitiveRegistry>) -> CleanupValidator {
        let bus = NotificationBus::default();
        CleanupValidator::new(registry, Arc::new(SecurityAuditor::in_memory(bus.clone())), bus)
    }

    #[test]
    #[serial]
    fn reports_residue_then_passes_after_erasure() {
        let registry = Arc::new(SensitiveRegistry::new());
        let handle = Arc::new(SecureHandle::from_string("t", "tok_validator_1".into()).unwrap());
        registry.register_secret(handle.clone(), SecretMetadata::new(SecretKind::AccessToken));
        registry
            .register_environment_variable("WARDEN_TEST_VALIDATOR_TOKEN")
            .unwrap();
        std::env::set_var("WARDEN_TEST_VALIDATOR_TOKEN", "tok_validator_1");

        let validator = validator(registry.clone());
        let before = validator.validate(ValidationScope::All);
        assert!(!before.passed);
        assert!(!before.passed_for(ValidationScope::Memory));
        assert!(!before.passed_for(ValidationScope::EnvironmentVariables));
        assert!(before.passed_for(ValidationScope::Files));

        handle.wipe();
        std::env::remove_var("WARDEN_TEST_VALIDATOR_TOKEN");
        let after = validator.validate(ValidationScope::All);
        assert!(after.passed, "{:?}", after.findings);
    }

    #[test]
    #[serial]
    fn detects_secret_copied_into_another_variable() {
        let registry = Arc::new(SensitiveRegistry::new());
        let handle = Arc::new(SecureHandle::from_string("t", "tok_copied_42".into()).unwrap());
        registry.register_secret(handle, SecretMetadata::default());
        std::env::set_var("WARDEN_TEST_STRAY_COPY", "tok_copied_42");

        let result = validator(registry).validate(ValidationScope::EnvironmentVariables);
        std::env::remove_var("WARDEN_TEST_STRAY_COPY");

        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].kind, FindingKind::SecretCopyInEnvironment);
        assert_eq!(result.findings[0].location, "WARDEN_TEST_STRAY_COPY");
    }

    #[test]
    fn file_scope_follows_registered_patterns() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SensitiveRegistry::new());
        registry.register_transient_file(dir.path().join("*.token"));
        std::fs::write(dir.path().join("a.token"), b"x").unwrap();

        let validator = validator(registry.clone());
        let result = validator.validate(ValidationScope::Files);
        assert_eq!(result.findings.len(), 1);
        let target = result.findings[0].remediation(&registry).unwrap();
        assert!(matches!(target, CleanupTarget::ConfigFile(_)));

        std::fs::remove_file(dir.path().join("a.token")).unwrap();
        assert!(validator.validate(ValidationScope::Files).passed);
    }

    #[test]
    fn targeted_validation_ignores_other_identifiers() {
        let registry = Arc::new(SensitiveRegistry::new());
        let mine = Arc::new(SecureHandle::from_string("a", "one".into()).unwrap());
        let other = Arc::new(SecureHandle::from_string("b", "two".into()).unwrap());
        let mine_id = registry.register_secret(mine.clone(), SecretMetadata::default());
        registry.register_secret(other, SecretMetadata::default());
        mine.wipe();

        let validator = validator(registry);
        let result = validator.validate_targets(ValidationScope::Memory, &[CleanupTarget::Memory(mine_id)]);
        assert!(result.passed);
        assert!(!validator.validate(ValidationScope::Memory).passed);
    }

    #[tokio::test]
    async fn every_run_lands_in_the_audit_trail() {
        let bus = NotificationBus::default();
        let auditor = Arc::new(SecurityAuditor::in_memory(bus.clone()));
        let registry = Arc::new(SensitiveRegistry::new());
        let handle = Arc::new(SecureHandle::from_string("t", "tok_audited".into()).unwrap());
        registry.register_secret(handle.clone(), SecretMetadata::default());
        let validator = CleanupValidator::new(registry, auditor.clone(), bus.clone());
        let mut notifications = bus.subscribe();

        assert!(!validator.validate(ValidationScope::All).passed);
        let failed = auditor.query(&AuditFilter {
            event_type: Some(AuditEventType::ValidationFailed),
            ..AuditFilter::default()
        });
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].severity, AuditSeverity::Critical);
        assert_eq!(failed[0].details.get("findings").map(String::as_str), Some("1"));
        assert!(matches!(
            notifications.try_recv(),
            Ok(GuardNotification::ValidationFailed {
                session: None,
                scope: ValidationScope::All,
                findings: 1,
            })
        ));

        handle.wipe();
        assert!(validator.validate(ValidationScope::Memory).passed);
        let passed = auditor.query(&AuditFilter {
            event_type: Some(AuditEventType::ValidationCompleted),
            ..AuditFilter::default()
        });
        assert_eq!(passed.len(), 1);
        assert!(!passed[0].details.contains_key("session"));
    }
}
