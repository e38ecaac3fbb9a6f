//! Launches an AI tool with its credentials held in secure handles and
//! cleans up when the tool goes away.
//!
//! Named secrets are moved out of the warden's own environment before the
//! child starts and injected only into the child's environment.

use crate::cleanup::{SecretKind, SecretMetadata, SessionId, SessionReport, SessionState, TriggerReason};
use crate::context::GuardContext;
use crate::core::models::ProcessFilter;
use crate::error::{HandleError, TriggerError};
use crate::monitor::SpawnWatchHandle;
use crate::platform;
use crate::secure::SecureHandle;
use crate::utils::env;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Secret variable '{0}' is not set")]
    MissingSecret(String),
    #[error("Secret handle error: {0}")]
    Handle(#[from] HandleError),
    #[error("Cleanup trigger error: {0}")]
    Trigger(#[from] TriggerError),
}

/// What to launch and what to protect.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Environment variables holding secrets for the child.
    pub secret_env: Vec<String>,
    /// Files the child may leave credentials in.
    pub transient_files: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub session: SessionId,
    pub report: SessionReport,
}

struct InjectedSecret {
    name: String,
    handle: Arc<SecureHandle>,
}

/// Run `spec` under supervision and return once the child has exited and
/// its session has been cleaned.
pub async fn run_supervised(
    ctx: &GuardContext,
    spawn_watch: &SpawnWatchHandle,
    spec: LaunchSpec,
) -> Result<RunOutcome, ProcessError> {
    let trigger = &ctx.trigger;
    let session = trigger.open_session(None, spec.timeout);

    let (mut child, pid) = match launch(ctx, session, &spec) {
        Ok(started) => started,
        Err(err) => {
            clean_unlaunched(ctx, session).await;
            return Err(err);
        }
    };
    let name = program_name(&spec.program);
    info!(pid, program = %name, %session, "Supervised process started");
    if !spawn_watch.announce_started(pid, Some(std::process::id()), &name) {
        debug!(pid, "Push listener not subscribed; relying on polling");
    }

    let status = child.wait().await?;
    let killed = was_killed(&status);
    spawn_watch.announce_exited(pid, killed);
    info!(pid, code = ?status.code(), killed, "Supervised process exited");

    let reason = if killed {
        TriggerReason::OwnerKilled { pid }
    } else {
        TriggerReason::OwnerExited { pid }
    };
    // Collapses with a firing already started by the monitor or a timeout.
    let report = trigger.fire(session, reason).await?;
    if !report.is_clean() {
        warn!(%session, "Session cleanup left residue or failed targets");
    }
    ctx.monitor.remove_process(pid);

    Ok(RunOutcome {
        exit_code: extract_exit_code(status),
        session,
        report,
    })
}

/// Protect the secrets, start the child and hand it to the session. Any
/// target attached before a failure stays armed on `session`.
fn launch(
    ctx: &GuardContext,
    session: SessionId,
    spec: &LaunchSpec,
) -> Result<(Child, u32), ProcessError> {
    let trigger = &ctx.trigger;
    let secrets = take_secrets(&spec.secret_env)?;
    for secret in &secrets {
        trigger.attach_secret(
            session,
            secret.handle.clone(),
            SecretMetadata::new(secret_kind(&secret.name)).from_env(&secret.name),
        )?;
        trigger.attach_environment_variable(session, &secret.name)?;
    }
    for path in &spec.transient_files {
        trigger.attach_transient_file(session, path.clone())?;
    }

    let child = {
        // The command keeps a copy of each injected value; it is dropped as
        // soon as the child exists.
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for secret in &secrets {
            secret.handle.with_secret(|bytes| {
                command.env(&secret.name, os_value(bytes));
            })?;
        }
        platform::prepare_command(&mut command);
        command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.to_string_lossy().into_owned(),
            source,
        })?
    };

    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("Failed to get child PID"))?;
    trigger.set_owner(session, pid)?;
    trigger.attach_process(session, pid)?;
    ctx.monitor.add_process(ProcessFilter::Pid(pid));
    Ok((child, pid))
}

/// The child never got going; erase whatever the session already holds.
async fn clean_unlaunched(ctx: &GuardContext, session: SessionId) {
    if ctx.trigger.discard_idle(session) || ctx.trigger.state(session) != Some(SessionState::Armed) {
        return;
    }
    match ctx.trigger.fire(session, TriggerReason::SpawnFailed).await {
        Ok(report) if report.is_clean() => info!(%session, "Launch failed; session cleaned"),
        Ok(_) => warn!(%session, "Launch failed; session cleanup left residue"),
        Err(err) => warn!(%session, error = %err, "Launch failed; session could not be cleaned"),
    }
}

fn take_secrets(names: &[String]) -> Result<Vec<InjectedSecret>, ProcessError> {
    let mut secrets = Vec::with_capacity(names.len());
    for name in names {
        let value = std::env::var_os(name).ok_or_else(|| ProcessError::MissingSecret(name.clone()))?;
        let handle = SecureHandle::new(name.clone(), value.into_encoded_bytes())?;
        env::remove(name);
        debug!(variable = %name, handle = %handle.id(), "Secret moved into secure handle");
        secrets.push(InjectedSecret {
            name: name.clone(),
            handle: Arc::new(handle),
        });
    }
    Ok(secrets)
}

fn secret_kind(name: &str) -> SecretKind {
    let upper = name.to_ascii_uppercase();
    if upper.contains("REFRESH") {
        SecretKind::RefreshToken
    } else if upper.contains("KEY") {
        SecretKind::ApiKey
    } else if upper.contains("TOKEN") {
        SecretKind::AccessToken
    } else {
        SecretKind::Other
    }
}

#[cfg(unix)]
fn os_value(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStrExt;
    OsStr::from_bytes(bytes).to_os_string()
}

#[cfg(not(unix))]
fn os_value(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

fn program_name(program: &OsStr) -> String {
    std::path::Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

#[cfg(unix)]
fn was_killed(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn was_killed(_status: &ExitStatus) -> bool {
    false
}

fn extract_exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::monitor::SpawnWatchBackend;
    use serial_test::serial;

    #[test]
    fn classifies_secret_names() {
        assert_eq!(secret_kind("ANTHROPIC_AUTH_TOKEN"), SecretKind::AccessToken);
        assert_eq!(secret_kind("OPENAI_API_KEY"), SecretKind::ApiKey);
        assert_eq!(secret_kind("CLAUDE_REFRESH_TOKEN"), SecretKind::RefreshToken);
        assert_eq!(secret_kind("SOMETHING"), SecretKind::Other);
    }

    #[test]
    fn program_name_strips_directories() {
        assert_eq!(program_name(OsStr::new("/usr/local/bin/claude")), "claude");
        assert_eq!(program_name(OsStr::new("codex")), "codex");
    }

    #[test]
    #[serial]
    fn secrets_leave_the_warden_environment() {
        std::env::set_var("WARDEN_TEST_SUPERVISOR_TOKEN", "tok_abc123");
        let secrets = take_secrets(&["WARDEN_TEST_SUPERVISOR_TOKEN".to_string()]).unwrap();
        assert!(std::env::var_os("WARDEN_TEST_SUPERVISOR_TOKEN").is_none());
        assert_eq!(
            secrets[0].handle.with_secret(|b| b.to_vec()).unwrap(),
            b"tok_abc123".to_vec()
        );
    }

    #[test]
    #[serial]
    fn missing_secret_is_an_error() {
        std::env::remove_var("WARDEN_TEST_SUPERVISOR_ABSENT");
        assert!(matches!(
            take_secrets(&["WARDEN_TEST_SUPERVISOR_ABSENT".to_string()]),
            Err(ProcessError::MissingSecret(_))
        ));
    }

    #[tokio::test]
    #[serial]
    async fn failed_launch_cleans_the_armed_session() {
        let ctx = GuardContext::builder()
            .in_memory_audit()
            .build(GuardConfig::default())
            .unwrap();
        let spawn_watch = SpawnWatchBackend::new().handle();
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("token.json");
        std::fs::write(&leftover, "tok_spawn_failure").unwrap();
        std::env::set_var("WARDEN_TEST_SUPERVISOR_SPAWN", "tok_spawn_failure");

        let spec = LaunchSpec {
            program: OsString::from("/nonexistent/secret-warden-missing-tool"),
            secret_env: vec!["WARDEN_TEST_SUPERVISOR_SPAWN".to_string()],
            transient_files: vec![leftover.clone()],
            ..LaunchSpec::default()
        };
        let result = run_supervised(&ctx, &spawn_watch, spec).await;

        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        let sessions = ctx.trigger.sessions();
        assert_eq!(sessions.len(), 1);
        let (session, state) = sessions[0];
        assert_eq!(state, SessionState::Completed);
        let report = ctx.trigger.report(session).unwrap();
        assert_eq!(report.reason, TriggerReason::SpawnFailed);
        assert!(report.is_clean());
        assert!(!leftover.exists());
        assert!(ctx.registry.secrets().iter().all(|s| s.handle.is_wiped()));
    }

    #[tokio::test]
    #[serial]
    async fn failure_before_anything_is_attached_leaves_no_session() {
        let ctx = GuardContext::builder()
            .in_memory_audit()
            .build(GuardConfig::default())
            .unwrap();
        let spawn_watch = SpawnWatchBackend::new().handle();
        std::env::remove_var("WARDEN_TEST_SUPERVISOR_ABSENT");

        let spec = LaunchSpec {
            program: OsString::from("true"),
            secret_env: vec!["WARDEN_TEST_SUPERVISOR_ABSENT".to_string()],
            ..LaunchSpec::default()
        };
        let result = run_supervised(&ctx, &spawn_watch, spec).await;

        assert!(matches!(result, Err(ProcessError::MissingSecret(_))));
        assert!(ctx.trigger.sessions().is_empty());
    }
}
