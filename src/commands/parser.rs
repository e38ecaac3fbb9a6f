//! Command-line interface definition.

use crate::audit::{AuditEventType, AuditSeverity};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// secret-warden - keeps AI tool credentials from outliving the tool
#[derive(Parser, Debug, Clone)]
#[command(
    name = "secret-warden",
    about = "Guards AI CLI credentials and erases them when the tool exits",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Configuration file (default: ~/.secret-warden/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `info,secret_warden=trace`
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Also append logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Launch an AI tool with protected credentials
    Run(RunArgs),

    /// Print process lifecycle events and monitor health
    Monitor(MonitorArgs),

    /// Inspect the security audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Environment variable holding a secret for the tool (repeatable)
    #[arg(long = "secret-env", value_name = "NAME")]
    pub secret_env: Vec<String>,

    /// File or glob the tool may leave credentials in (repeatable)
    #[arg(long = "transient-file", value_name = "PATH")]
    pub transient_files: Vec<PathBuf>,

    /// Clean up and stop the tool after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Program and arguments, after `--`
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct MonitorArgs {
    /// Additional process name pattern to track (repeatable)
    #[arg(long = "pattern", value_name = "REGEX")]
    pub patterns: Vec<String>,

    /// Emit one JSON object per line
    #[arg(long)]
    pub json: bool,

    /// Seconds between health reports
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub health_every: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    /// Recompute the hash chain and report whether it is intact
    Verify,

    /// Print audit entries as JSON lines
    Show {
        #[arg(long, value_name = "TYPE")]
        event_type: Option<AuditEventType>,

        #[arg(long, value_name = "LEVEL")]
        min_severity: Option<AuditSeverity>,

        /// Only the most recent N matching entries
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_collects_command_after_separator() {
        let cli = Cli::try_parse_from([
            "secret-warden",
            "run",
            "--secret-env",
            "ANTHROPIC_AUTH_TOKEN",
            "--timeout",
            "60",
            "--",
            "claude",
            "--print",
            "hi",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.secret_env, vec!["ANTHROPIC_AUTH_TOKEN".to_string()]);
        assert_eq!(args.timeout, Some(60));
        assert_eq!(
            args.command,
            vec![
                OsString::from("claude"),
                OsString::from("--print"),
                OsString::from("hi")
            ]
        );
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["secret-warden", "run", "--secret-env", "X"]).is_err());
    }

    #[test]
    fn audit_show_parses_filters() {
        let cli = Cli::try_parse_from([
            "secret-warden",
            "audit",
            "show",
            "--event-type",
            "validation_failed",
            "--limit",
            "5",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Audit {
                action: AuditAction::Show {
                    event_type: Some(AuditEventType::ValidationFailed),
                    min_severity: None,
                    limit: Some(5),
                }
            }
        ));
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["secret-warden", "monitor", "--json", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
