use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionArmed,
    TriggerFired,
    CleanupRequested,
    CleanupCompleted,
    ValidationCompleted,
    ValidationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    PartialSuccess,
    Failure,
    Passed,
    Failed,
    Noted,
}

/// An entry before the auditor assigns its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub severity: AuditSeverity,
    pub details: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: actor.into(),
            outcome: AuditOutcome::Noted,
            severity: AuditSeverity::Info,
            details: BTreeMap::new(),
        }
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// One link of the hash chain as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub severity: AuditSeverity,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Hash of the previous entry (hex), zeros for the first one.
    pub prev_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub min_severity: Option<AuditSeverity>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.event_type.map_or(true, |t| entry.event_type == t)
            && self.min_severity.map_or(true, |s| entry.severity >= s)
            && self.actor.as_deref().map_or(true, |a| entry.actor == a)
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
            .map_err(|_| format!("unknown audit event type '{}'", s))
    }
}

impl std::str::FromStr for AuditSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
            .map_err(|_| format!("unknown audit severity '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snake_case_names() {
        assert_eq!(
            "validation_failed".parse::<AuditEventType>().unwrap(),
            AuditEventType::ValidationFailed
        );
        assert_eq!("Critical".parse::<AuditSeverity>().unwrap(), AuditSeverity::Critical);
        assert!("nope".parse::<AuditEventType>().is_err());
    }

    #[test]
    fn filter_applies_minimum_severity() {
        let entry = AuditLogEntry {
            sequence: 0,
            timestamp: Utc::now(),
            event_type: AuditEventType::TriggerFired,
            actor: "cleanup-trigger".into(),
            outcome: AuditOutcome::Noted,
            severity: AuditSeverity::Warning,
            details: BTreeMap::new(),
            prev_hash: crate::audit::GENESIS_PREV_HASH.to_string(),
        };
        let strict = AuditFilter {
            min_severity: Some(AuditSeverity::Critical),
            ..AuditFilter::default()
        };
        assert!(!strict.matches(&entry));
        assert!(AuditFilter::default().matches(&entry));
    }
}
