//! `secret-warden run`: launch a tool under supervision.

use crate::commands::parser::RunArgs;
use crate::config::GuardConfig;
use crate::context::GuardContext;
use crate::monitor::{MonitorMode, SpawnWatchBackend};
use crate::signal::{install_panic_hook, spawn_shutdown_listener};
use crate::supervisor::{run_supervised, LaunchSpec};
use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

impl RunArgs {
    fn into_launch_spec(self, config: &GuardConfig) -> LaunchSpec {
        let mut command = self.command.into_iter();
        LaunchSpec {
            program: command.next().unwrap_or_default(),
            args: command.collect(),
            secret_env: self.secret_env,
            transient_files: self.transient_files,
            timeout: self
                .timeout
                .map(Duration::from_secs)
                .or_else(|| config.session_timeout()),
        }
    }
}

pub async fn handle_run(config: GuardConfig, args: RunArgs) -> Result<ExitCode> {
    let spec = args.into_launch_spec(&config);

    let backend = SpawnWatchBackend::new();
    let spawn_watch = backend.handle();
    let ctx = GuardContext::builder()
        .backend(Arc::new(backend))
        .build(config)
        .context("Failed to assemble warden components")?;

    let mode = ctx.start()?;
    if mode == MonitorMode::PollingOnly {
        warn!("Push events unavailable; exits are detected by polling only");
    }
    install_panic_hook(ctx.trigger.clone());
    let shutdown = spawn_shutdown_listener(ctx.trigger.clone());

    let outcome = run_supervised(&ctx, &spawn_watch, spec).await;

    shutdown.abort();
    ctx.stop().await;

    let outcome = outcome?;
    if outcome.report.is_clean() {
        info!(session = %outcome.session, "Session cleaned and validated");
    } else {
        eprintln!(
            "warning: cleanup for {} was incomplete; run `secret-warden audit show --min-severity warning`",
            outcome.session
        );
    }
    Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1)))
}
