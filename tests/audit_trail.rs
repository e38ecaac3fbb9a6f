//! Cleanup runs land in the hash-chained log, and edits to it are caught.

mod common;

use common::fast_config;
use secret_warden::audit::{AuditEventType, AuditFilter, AuditRecord};
use secret_warden::cleanup::{SecretKind, SecretMetadata, TriggerReason};
use secret_warden::config::GuardConfig;
use secret_warden::error::AuditError;
use secret_warden::{GuardContext, GuardNotification, SecureHandle};
use std::sync::Arc;
use tempfile::TempDir;

fn context(dir: &TempDir) -> GuardContext {
    GuardContext::new(GuardConfig {
        audit_log_path: Some(dir.path().join("audit").join("warden.log")),
        ..fast_config()
    })
    .unwrap()
}

async fn run_one_session(ctx: &GuardContext) {
    let session = ctx.trigger.open_session(None, None);
    let handle = Arc::new(SecureHandle::from_string("token", "tok_audit".to_string()).unwrap());
    ctx.trigger
        .attach_secret(session, handle, SecretMetadata::new(SecretKind::AccessToken))
        .unwrap();
    let report = ctx.trigger.fire(session, TriggerReason::Manual).await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn session_lifecycle_is_recorded_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    run_one_session(&ctx).await;

    let recorded = ctx.auditor.query(&AuditFilter::default());
    let types: Vec<_> = recorded.iter().map(|e| e.event_type).collect();
    for expected in [
        AuditEventType::SessionArmed,
        AuditEventType::TriggerFired,
        AuditEventType::CleanupCompleted,
        AuditEventType::ValidationCompleted,
    ] {
        assert!(types.contains(&expected), "missing {:?} in {:?}", expected, types);
    }
    assert!(ctx.auditor.verify_chain_integrity());
    let head = ctx.auditor.head_hash();
    drop(ctx);

    let reopened = context(&dir);
    assert!(!reopened.auditor.is_compromised());
    assert_eq!(reopened.auditor.head_hash(), head);
    assert_eq!(reopened.auditor.len(), recorded.len());
}

#[tokio::test]
async fn edited_log_is_detected_and_never_extended() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    run_one_session(&ctx).await;
    let mut notifications = ctx.bus.subscribe();

    let path = ctx.auditor.path().unwrap().to_path_buf();
    let original = std::fs::read_to_string(&path).unwrap();
    let tampered = original.replacen("\"actor\":\"", "\"actor\":\"x", 1);
    assert_ne!(original, tampered);
    std::fs::write(&path, tampered).unwrap();

    assert!(!ctx.auditor.verify_chain_integrity());
    assert!(ctx.auditor.is_compromised());
    assert!(matches!(
        notifications.try_recv(),
        Ok(GuardNotification::AuditIntegrityBroken { .. })
    ));
    assert!(matches!(
        ctx.auditor
            .record(AuditRecord::new(AuditEventType::CleanupRequested, "test")),
        Err(AuditError::IntegrityBroken { .. })
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), original.lines().count());
}
