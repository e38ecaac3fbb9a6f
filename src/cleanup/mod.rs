//! Credential cleanup engine.

pub mod executor;
pub mod manager;
pub mod operation;
pub mod registry;
pub mod trigger;
pub mod validator;

pub use executor::{ExecOutcome, SystemExecutor, TargetExecutor};
pub use manager::{CleanupManager, ManagerSettings};
pub use operation::{
    CleanupOperation, CleanupPriority, CleanupResult, CleanupStatus, CleanupTarget, RetryPolicy,
    TargetKind, TargetOutcome, TargetStatus,
};
pub use registry::{RegisteredSecret, SecretKind, SecretMetadata, SensitiveRegistry};
pub use trigger::{
    CleanupTrigger, SessionId, SessionReport, SessionState, TriggerReason, TriggerSettings,
};
pub use validator::{
    CleanupValidator, Finding, FindingKind, ScopeVerdict, ValidationResult, ValidationScope,
};
