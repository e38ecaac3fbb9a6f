//! `secret-warden audit`: verify and read the audit chain.

use crate::audit::{AuditFilter, SecurityAuditor};
use crate::commands::parser::AuditAction;
use crate::config::GuardConfig;
use crate::events::NotificationBus;
use anyhow::{anyhow, Result};
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
/// Exit status when the chain does not verify.
const EXIT_CHAIN_BROKEN: u8 = 2;

pub fn handle_audit(config: &GuardConfig, action: AuditAction) -> Result<ExitCode> {
    run_audit(config, action).map(ExitCode::from)
}

fn run_audit(config: &GuardConfig, action: AuditAction) -> Result<u8> {
    let path = config
        .audit_log_path
        .as_ref()
        .ok_or_else(|| anyhow!("No audit log configured; set `audit_log_path`"))?;
    let auditor = SecurityAuditor::open(path, NotificationBus::default())?;

    match action {
        AuditAction::Verify => {
            if auditor.verify_chain_integrity() {
                println!("{}: intact ({} entries)", path.display(), auditor.len());
                Ok(EXIT_OK)
            } else {
                println!(
                    "{}: BROKEN after {} verified entries",
                    path.display(),
                    auditor.len()
                );
                Ok(EXIT_CHAIN_BROKEN)
            }
        }
        AuditAction::Show {
            event_type,
            min_severity,
            limit,
        } => {
            let filter = AuditFilter {
                event_type,
                min_severity,
                limit,
                ..AuditFilter::default()
            };
            for entry in auditor.query(&filter) {
                println!("{}", serde_json::to_string(&entry)?);
            }
            if auditor.is_compromised() {
                eprintln!("warning: chain is broken; entries after the break are not shown");
                return Ok(EXIT_CHAIN_BROKEN);
            }
            Ok(EXIT_OK)
        }
    }
}
