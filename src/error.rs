//! Unified error handling for secret-warden
//!
//! Each subsystem owns a `thiserror` enum; `WardenError` wraps them with a
//! category and severity so callers (CLI, notification layer) can decide
//! what is user-visible and what stays in the logs.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for the library surface.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process tracking error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Event listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("Cleanup trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Secure handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("Process error: {message}")]
    Process {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WardenError {
    pub fn process(message: impl Into<String>) -> Self {
        WardenError::Process {
            message: message.into(),
            source: None,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            WardenError::Config(_) => ErrorCategory::Config,
            WardenError::Tracker(_) | WardenError::Listener(_) => ErrorCategory::Monitoring,
            WardenError::Cleanup(_) | WardenError::Trigger(_) => ErrorCategory::Cleanup,
            WardenError::Audit(_) => ErrorCategory::Audit,
            WardenError::Handle(_) => ErrorCategory::Secret,
            WardenError::Process { .. } => ErrorCategory::Process,
            WardenError::Io(_) => ErrorCategory::Filesystem,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            WardenError::Config(_) => ErrorSeverity::High,
            // Push-source failures only degrade monitoring.
            WardenError::Listener(_) => ErrorSeverity::Low,
            WardenError::Tracker(_) => ErrorSeverity::Medium,
            WardenError::Cleanup(err) if err.is_transient() => ErrorSeverity::Medium,
            WardenError::Cleanup(_) => ErrorSeverity::High,
            WardenError::Trigger(_) => ErrorSeverity::High,
            WardenError::Audit(AuditError::IntegrityBroken { .. }) => ErrorSeverity::Critical,
            WardenError::Audit(_) => ErrorSeverity::High,
            WardenError::Handle(_) => ErrorSeverity::Medium,
            WardenError::Process { .. } => ErrorSeverity::Medium,
            WardenError::Io(_) => ErrorSeverity::Medium,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            WardenError::Config(_) => false,
            WardenError::Audit(AuditError::IntegrityBroken { .. }) => false,
            WardenError::Cleanup(err) => err.is_transient(),
            _ => true,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            WardenError::Config(err) => format!("Configuration problem: {}", err),
            WardenError::Tracker(_) | WardenError::Listener(_) => {
                "Process monitoring is running in a reduced mode".to_string()
            }
            WardenError::Cleanup(err) => format!("Credential cleanup problem: {}", err),
            WardenError::Trigger(err) => format!("Cleanup could not be started: {}", err),
            WardenError::Audit(AuditError::IntegrityBroken { sequence }) => format!(
                "Security audit log has been altered or corrupted (entry #{})",
                sequence
            ),
            WardenError::Audit(err) => format!("Audit log problem: {}", err),
            WardenError::Handle(err) => format!("Secret handling problem: {}", err),
            WardenError::Process { message, .. } => format!("Process problem: {}", message),
            WardenError::Io(err) => format!("File system problem: {}", err),
        }
    }
}

impl From<anyhow::Error> for WardenError {
    fn from(err: anyhow::Error) -> Self {
        WardenError::Process {
            message: err.to_string(),
            source: None,
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Monitoring,
    Cleanup,
    Audit,
    Secret,
    Process,
    Filesystem,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Monitoring => "Monitoring",
            ErrorCategory::Cleanup => "Cleanup",
            ErrorCategory::Audit => "Audit",
            ErrorCategory::Secret => "Secret",
            ErrorCategory::Process => "Process",
            ErrorCategory::Filesystem => "Filesystem",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result type alias for convenience
pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
    #[error("Invalid AI tool pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Process table enumeration failed: {0}")]
    Enumeration(String),
    #[error("Process {0} not found")]
    ProcessNotFound(u32),
    #[error("Permission denied accessing process {0}")]
    PermissionDenied(u32),
    #[error("Tracker is already running")]
    AlreadyRunning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The platform facility does not exist on this host.
    #[error("Push notifications are not supported by backend '{backend}'")]
    Unsupported { backend: String },
    #[error("Push notification service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Insufficient privilege to subscribe to process events: {0}")]
    InsufficientPrivilege(String),
    #[error("Listener is already running")]
    AlreadyListening,
}

#[derive(Error, Debug, Clone)]
pub enum CleanupError {
    #[error("Access denied while cleaning {target}: {message}")]
    AccessDenied { target: String, message: String },
    #[error("Resource busy while cleaning {target}: {message}")]
    Busy { target: String, message: String },
    #[error("File operation failed on {}: {message}", path.display())]
    File { path: PathBuf, message: String },
    #[error("Process {0} is still alive after forced termination")]
    ProcessStillAlive(u32),
    #[error("Cleanup attempt exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Cleanup deadline reached before completion")]
    DeadlineExceeded,
    #[error("Invalid cleanup target: {0}")]
    InvalidTarget(String),
    #[error("Cleanup worker failed: {0}")]
    Worker(String),
}

impl CleanupError {
    /// Transient failures are retried according to the operation's policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CleanupError::AccessDenied { .. }
                | CleanupError::Busy { .. }
                | CleanupError::File { .. }
                | CleanupError::ProcessStillAlive(_)
                | CleanupError::Timeout { .. }
        )
    }

    pub(crate) fn from_io(path: &std::path::Path, err: &io::Error) -> Self {
        let target = path.display().to_string();
        match err.kind() {
            io::ErrorKind::PermissionDenied => CleanupError::AccessDenied {
                target,
                message: err.to_string(),
            },
            io::ErrorKind::WouldBlock => CleanupError::Busy {
                target,
                message: err.to_string(),
            },
            _ => CleanupError::File {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Session {0} not found")]
    SessionNotFound(String),
    #[error("Session {0} has nothing registered for cleanup")]
    NotArmed(String),
    #[error("Cleanup for session {0} was abandoned before reporting")]
    Abandoned(String),
    #[error("Session {0} has already fired; open a new session")]
    AlreadyFired(String),
    #[error("Cannot attach cleanup target: {0}")]
    InvalidTarget(String),
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit chain broken at entry #{sequence}")]
    IntegrityBroken { sequence: u64 },
    #[error("Audit log I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Audit entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Secret handle {0} has been wiped")]
    Wiped(String),
    #[error("Secret value is empty")]
    Empty,
}
