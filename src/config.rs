//! Typed configuration for the warden
//!
//! Options are read from an optional TOML file layered with
//! `SECRET_WARDEN_*` environment variables and validated once at load time.

use crate::error::ConfigError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIRECTORY: &str = ".secret-warden";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const AUDIT_FILE_NAME: &str = "audit.log";
pub const ENV_PREFIX: &str = "SECRET_WARDEN";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(2000);
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_millis(2000);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_CLEANUP_CONCURRENCY: usize = 3;
pub const DEFAULT_RETRY_MAX: u32 = 2;

/// Process names the warden treats as AI coding tools unless configured otherwise.
pub const DEFAULT_AI_TOOL_PATTERNS: &[&str] = &["claude", "codex", "gemini", "anthropic", "copilot"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub poll_interval_ms: u64,
    pub dedup_window_ms: u64,
    pub cleanup_concurrency: usize,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub ai_tool_patterns: Vec<String>,
    /// How long a process may stay `Unknown` before it is treated as exited.
    pub unknown_grace_ms: u64,
    pub history_capacity: usize,
    pub listener_queue_capacity: usize,
    pub operation_timeout_ms: u64,
    /// Wait between graceful and forced termination.
    pub process_grace_ms: u64,
    pub push_events: bool,
    pub audit_log_path: Option<PathBuf>,
    pub session_timeout_secs: Option<u64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW.as_millis() as u64,
            cleanup_concurrency: DEFAULT_CLEANUP_CONCURRENCY,
            retry_max: DEFAULT_RETRY_MAX,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            shutdown_deadline_ms: DEFAULT_SHUTDOWN_DEADLINE.as_millis() as u64,
            ai_tool_patterns: DEFAULT_AI_TOOL_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            unknown_grace_ms: 3000,
            history_capacity: 256,
            listener_queue_capacity: 1024,
            operation_timeout_ms: 1000,
            process_grace_ms: 500,
            push_events: true,
            audit_log_path: default_audit_path(),
            session_timeout_secs: None,
        }
    }
}

impl GuardConfig {
    /// Load configuration from `path` (or the default location) plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match path {
            Some(explicit) => {
                builder = builder.add_source(config::File::from(explicit.to_path_buf()));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ai_tool_patterns"),
        );

        let config: GuardConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration integrity
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("poll_interval_ms", self.poll_interval_ms)?;
        positive("dedup_window_ms", self.dedup_window_ms)?;
        positive("cleanup_concurrency", self.cleanup_concurrency as u64)?;
        positive("shutdown_deadline_ms", self.shutdown_deadline_ms)?;
        positive("operation_timeout_ms", self.operation_timeout_ms)?;
        positive("history_capacity", self.history_capacity as u64)?;
        positive("listener_queue_capacity", self.listener_queue_capacity as u64)?;

        if self.retry_max > 10 {
            return Err(ConfigError::InvalidValue {
                field: "retry_max",
                message: format!("{} exceeds the maximum of 10", self.retry_max),
            });
        }

        self.compile_patterns()?;

        if self.shutdown_deadline_ms < self.operation_timeout_ms {
            tracing::warn!(
                shutdown_deadline_ms = self.shutdown_deadline_ms,
                operation_timeout_ms = self.operation_timeout_ms,
                "shutdown deadline is shorter than a single cleanup attempt"
            );
        }

        Ok(())
    }

    /// Compile the AI tool name patterns (case-insensitive).
    pub fn compile_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.ai_tool_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn unknown_grace(&self) -> Duration {
        Duration::from_millis(self.unknown_grace_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn process_grace(&self) -> Duration {
        Duration::from_millis(self.process_grace_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }
}

pub fn config_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIRECTORY))
}

pub fn default_config_path() -> Option<PathBuf> {
    config_directory().map(|dir| dir.join(CONFIG_FILE_NAME))
}

fn default_audit_path() -> Option<PathBuf> {
    config_directory().map(|dir| dir.join(AUDIT_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = GuardConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.dedup_window(), Duration::from_secs(2));
        assert_eq!(config.cleanup_concurrency, 3);
        assert_eq!(config.retry_max, 2);
        assert_eq!(config.retry_backoff(), Duration::from_millis(100));
        assert_eq!(config.shutdown_deadline(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = GuardConfig {
            poll_interval_ms: 0,
            ..GuardConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                ..
            })
        ));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let config = GuardConfig {
            ai_tool_patterns: vec!["claude(".to_string()],
            ..GuardConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let patterns = GuardConfig::default().compile_patterns().unwrap();
        assert!(patterns.iter().any(|p| p.is_match("Claude-Code")));
    }

    #[test]
    #[serial]
    fn load_reads_file_and_environment_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "poll_interval_ms = 250").unwrap();
        writeln!(file, "cleanup_concurrency = 5").unwrap();
        drop(file);

        std::env::set_var("SECRET_WARDEN_SHUTDOWN_DEADLINE_MS", "1500");
        let loaded = GuardConfig::load(Some(&path));
        std::env::remove_var("SECRET_WARDEN_SHUTDOWN_DEADLINE_MS");

        let config = loaded.unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.cleanup_concurrency, 5);
        assert_eq!(config.shutdown_deadline_ms, 1500);
        assert_eq!(config.dedup_window_ms, 2000);
    }

    #[test]
    #[serial]
    fn load_rejects_invalid_values_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cleanup_concurrency = 0\n").unwrap();
        assert!(GuardConfig::load(Some(&path)).is_err());
    }
}
