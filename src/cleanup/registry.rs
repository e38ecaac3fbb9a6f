//! Inbound registration: what the cleanup engine must eventually erase.
//!
//! The registry is also the validator's source of truth; it checks exactly
//! the identifiers recorded here.

use crate::cleanup::operation::CleanupTarget;
use crate::error::CleanupError;
use crate::secure::{HandleId, SecureHandle};
use crate::utils::env;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    AccessToken,
    RefreshToken,
    ApiKey,
    #[default]
    Other,
}

/// Describes a registered secret without containing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub kind: SecretKind,
    /// Environment variable the value was taken from, if any.
    pub source_env: Option<String>,
    pub owner_pid: Option<u32>,
}

impl SecretMetadata {
    pub fn new(kind: SecretKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn from_env(mut self, name: impl Into<String>) -> Self {
        self.source_env = Some(name.into());
        self
    }

    pub fn owned_by(mut self, pid: u32) -> Self {
        self.owner_pid = Some(pid);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredSecret {
    pub handle: Arc<SecureHandle>,
    pub metadata: SecretMetadata,
}

#[derive(Debug, Default)]
pub struct SensitiveRegistry {
    secrets: DashMap<HandleId, RegisteredSecret>,
    environment: RwLock<BTreeSet<String>>,
    files: RwLock<BTreeSet<PathBuf>>,
}

impl SensitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_secret(&self, handle: Arc<SecureHandle>, metadata: SecretMetadata) -> HandleId {
        let id = handle.id();
        tracing::debug!(handle = %id, kind = ?metadata.kind, "secret registered");
        self.secrets.insert(id, RegisteredSecret { handle, metadata });
        id
    }

    pub fn register_environment_variable(&self, name: &str) -> Result<(), CleanupError> {
        if !env::is_valid_name(name) {
            return Err(CleanupError::InvalidTarget(format!(
                "environment variable name {:?}",
                name
            )));
        }
        self.environment.write().insert(name.to_string());
        Ok(())
    }

    /// Register an exact path or a glob pattern.
    pub fn register_transient_file(&self, path: impl Into<PathBuf>) {
        self.files.write().insert(path.into());
    }

    pub fn handle(&self, id: HandleId) -> Option<Arc<SecureHandle>> {
        self.secrets.get(&id).map(|entry| entry.handle.clone())
    }

    pub fn secrets(&self) -> Vec<RegisteredSecret> {
        self.secrets.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn environment_variables(&self) -> Vec<String> {
        self.environment.read().iter().cloned().collect()
    }

    pub fn transient_files(&self) -> Vec<PathBuf> {
        self.files.read().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty() && self.environment.read().is_empty() && self.files.read().is_empty()
    }

    /// Forget the identifiers behind `targets` once they have been erased.
    /// Handles that are still active and anything in `keep` stay registered.
    pub fn release(&self, targets: &[CleanupTarget], keep: &HashSet<CleanupTarget>) -> usize {
        let mut released = 0;
        for target in targets.iter().flat_map(|t| t.flatten()) {
            if keep.contains(&target) {
                continue;
            }
            let removed = match &target {
                CleanupTarget::Memory(id) => self
                    .secrets
                    .remove_if(id, |_, secret| secret.handle.is_wiped())
                    .is_some(),
                CleanupTarget::EnvironmentVariable(name) => self.environment.write().remove(name),
                CleanupTarget::ConfigFile(path) => self.files.write().remove(path),
                CleanupTarget::Process { .. } | CleanupTarget::Composite(_) => false,
            };
            if removed {
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, "registry entries released");
        }
        released
    }

    /// Every registered item as a cleanup target, secrets first.
    pub fn all_targets(&self) -> Vec<CleanupTarget> {
        let mut targets: Vec<CleanupTarget> = self
            .secrets
            .iter()
            .map(|entry| CleanupTarget::Memory(*entry.key()))
            .collect();
        targets.sort_by_key(|t| t.to_string());
        targets.extend(
            self.environment_variables()
                .into_iter()
                .map(CleanupTarget::EnvironmentVariable),
        );
        targets.extend(self.transient_files().into_iter().map(CleanupTarget::ConfigFile));
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_all_target_kinds() {
        let registry = SensitiveRegistry::new();
        let handle = Arc::new(SecureHandle::from_string("token", "tok_abc123".into()).unwrap());
        let id = registry.register_secret(handle, SecretMetadata::new(SecretKind::AccessToken));
        registry.register_environment_variable("ANTHROPIC_AUTH_TOKEN").unwrap();
        registry.register_transient_file("/tmp/warden-*.json");

        let targets = registry.all_targets();
        assert_eq!(targets[0], CleanupTarget::Memory(id));
        assert_eq!(targets.len(), 3);
        assert!(registry.handle(id).is_some());
    }

    #[test]
    fn rejects_invalid_environment_names() {
        let registry = SensitiveRegistry::new();
        assert!(matches!(
            registry.register_environment_variable("BAD=NAME"),
            Err(CleanupError::InvalidTarget(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn release_drops_erased_entries_only() {
        let registry = SensitiveRegistry::new();
        let wiped = Arc::new(SecureHandle::from_string("a", "tok_wiped".into()).unwrap());
        let active = Arc::new(SecureHandle::from_string("b", "tok_active".into()).unwrap());
        let wiped_id = registry.register_secret(wiped.clone(), SecretMetadata::default());
        let active_id = registry.register_secret(active, SecretMetadata::default());
        registry.register_environment_variable("WARDEN_SHARED").unwrap();
        registry.register_transient_file("/tmp/warden-release.json");
        wiped.wipe();

        let targets = vec![
            CleanupTarget::Memory(wiped_id),
            CleanupTarget::Memory(active_id),
            CleanupTarget::EnvironmentVariable("WARDEN_SHARED".into()),
            CleanupTarget::ConfigFile("/tmp/warden-release.json".into()),
        ];
        let keep: HashSet<_> = [CleanupTarget::EnvironmentVariable("WARDEN_SHARED".into())].into();

        assert_eq!(registry.release(&targets, &keep), 2);
        assert!(registry.handle(wiped_id).is_none());
        assert!(registry.handle(active_id).is_some());
        assert_eq!(registry.environment_variables(), vec!["WARDEN_SHARED".to_string()]);
        assert!(registry.transient_files().is_empty());
    }
}
