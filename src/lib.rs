//! secret-warden
//!
//! Supervises AI CLI tools, keeps their credentials in secure handles and
//! erases every trace of them when the tool exits, crashes or the host
//! shuts down. Cleanup runs are recorded in a hash-chained audit log.

pub mod audit;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod events;
pub mod monitor;
pub mod platform;
pub mod secure;
pub mod signal;
pub mod supervisor;
pub mod utils;

pub use audit::{AuditFilter, AuditLogEntry, SecurityAuditor};
pub use cleanup::{
    CleanupManager, CleanupResult, CleanupTarget, CleanupTrigger, CleanupValidator,
    SessionId, SessionReport, TriggerReason,
};
pub use config::GuardConfig;
pub use context::GuardContext;
pub use core::models::*;
pub use error::{WardenError, WardenResult};
pub use events::{GuardNotification, NotificationBus};
pub use monitor::{MonitorMode, ProcessMonitor};
pub use secure::SecureHandle;
pub use supervisor::{run_supervised, LaunchSpec, ProcessError, RunOutcome};
