//! `secret-warden monitor`: stream lifecycle events until interrupted.

use crate::commands::parser::MonitorArgs;
use crate::config::GuardConfig;
use crate::context::GuardContext;
use crate::core::models::MonitoringEvent;
use crate::monitor::HealthReport;
use crate::signal::wait_for_shutdown;
use anyhow::{Context, Result};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub async fn handle_monitor(mut config: GuardConfig, args: MonitorArgs) -> Result<ExitCode> {
    config.ai_tool_patterns.extend(args.patterns);
    let ctx = GuardContext::new(config).context("Failed to assemble warden components")?;
    let mode = ctx.start()?;
    eprintln!("Monitoring in {:?} mode; press Ctrl-C to stop", mode);

    let mut events = ctx.monitor.subscribe();
    let mut health = tokio::time::interval(Duration::from_secs(args.health_every.max(1)));
    health.tick().await;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => print_event(&event, args.json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = health.tick() => print_health(&ctx.monitor.check_health(), args.json)?,
            signal = &mut shutdown => {
                if let Ok(signal) = signal {
                    eprintln!("Stopping on {}", signal);
                }
                break;
            }
        }
    }

    let stats = ctx.monitor.get_statistics();
    ctx.stop().await;
    if args.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        eprintln!(
            "forwarded {} events, suppressed {} duplicates",
            stats.forwarded, stats.duplicates_suppressed
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &MonitoringEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let name = event.record.as_ref().map(|r| r.name.as_str()).unwrap_or("?");
    println!(
        "{} {:?} pid={} name={} state={} via {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.kind,
        event.pid,
        name,
        event.state,
        event.source
    );
    Ok(())
}

fn print_health(report: &HealthReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::json!({ "health": report }));
    } else {
        eprintln!(
            "health: mode={:?} poll={} push={}{}",
            report.mode,
            source_label(report.poll.available, report.poll.stale),
            source_label(report.push.available, report.push.stale),
            report
                .push_error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn source_label(available: bool, stale: bool) -> &'static str {
    match (available, stale) {
        (false, _) => "unavailable",
        (true, true) => "stale",
        (true, false) => "ok",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_source_health() {
        assert_eq!(source_label(false, true), "unavailable");
        assert_eq!(source_label(true, true), "stale");
        assert_eq!(source_label(true, false), "ok");
    }
}
