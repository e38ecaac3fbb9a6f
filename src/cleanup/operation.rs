//! Cleanup requests and their results.

use crate::secure::HandleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Something that has to be erased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum CleanupTarget {
    Memory(HandleId),
    EnvironmentVariable(String),
    /// An exact path or a glob pattern.
    ConfigFile(PathBuf),
    Process { pid: u32 },
    Composite(Vec<CleanupTarget>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Memory,
    EnvironmentVariable,
    ConfigFile,
    Process,
    Composite,
}

impl CleanupTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            CleanupTarget::Memory(_) => TargetKind::Memory,
            CleanupTarget::EnvironmentVariable(_) => TargetKind::EnvironmentVariable,
            CleanupTarget::ConfigFile(_) => TargetKind::ConfigFile,
            CleanupTarget::Process { .. } => TargetKind::Process,
            CleanupTarget::Composite(_) => TargetKind::Composite,
        }
    }

    /// Leaf targets in depth-first order, without duplicates.
    pub fn flatten(&self) -> Vec<CleanupTarget> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, leaves: &mut Vec<CleanupTarget>) {
        match self {
            CleanupTarget::Composite(children) => {
                for child in children {
                    child.collect_leaves(leaves);
                }
            }
            leaf => {
                if !leaves.contains(leaf) {
                    leaves.push(leaf.clone());
                }
            }
        }
    }

    /// Identity of the target set, independent of order and nesting.
    pub fn identity(&self) -> String {
        let mut keys: Vec<String> = self.flatten().iter().map(|t| t.to_string()).collect();
        keys.sort();
        keys.join("|")
    }
}

/// Names locations only, never values.
impl fmt::Display for CleanupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupTarget::Memory(id) => write!(f, "memory:{}", id),
            CleanupTarget::EnvironmentVariable(name) => write!(f, "env:{}", name),
            CleanupTarget::ConfigFile(path) => write!(f, "file:{}", path.display()),
            CleanupTarget::Process { pid } => write!(f, "process:{}", pid),
            CleanupTarget::Composite(children) => write!(f, "composite[{}]", children.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based): doubles each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_RETRY_MAX,
            crate::config::DEFAULT_RETRY_BACKOFF,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupOperation {
    pub id: Uuid,
    pub target: CleanupTarget,
    /// Whether an attempt that timed out may safely be repeated.
    pub idempotent: bool,
    pub priority: CleanupPriority,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub requested_at: DateTime<Utc>,
}

impl CleanupOperation {
    pub fn new(target: CleanupTarget) -> Self {
        let idempotent = !target
            .flatten()
            .iter()
            .any(|t| t.kind() == TargetKind::Process);
        Self {
            id: Uuid::new_v4(),
            target,
            idempotent,
            priority: CleanupPriority::Normal,
            retry: RetryPolicy::default(),
            context: BTreeMap::new(),
            requested_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: CleanupPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded,
    /// Nothing left to erase; counts as success.
    AlreadyClean,
    Failed,
    TimedOut,
}

impl TargetStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetStatus::Succeeded | TargetStatus::AlreadyClean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: CleanupTarget,
    pub status: TargetStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub operation_id: Uuid,
    pub success: bool,
    pub status: CleanupStatus,
    pub outcomes: Vec<TargetOutcome>,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when this request joined an identical one already in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_with: Option<Uuid>,
}

impl CleanupResult {
    pub fn from_outcomes(operation_id: Uuid, outcomes: Vec<TargetOutcome>, duration: Duration) -> Self {
        let failed = outcomes.iter().filter(|o| !o.status.is_success()).count();
        let status = match failed {
            0 => CleanupStatus::Success,
            n if n == outcomes.len() => CleanupStatus::Failure,
            _ => CleanupStatus::PartialSuccess,
        };
        let error = if failed == 0 {
            None
        } else {
            let detail: Vec<String> = outcomes
                .iter()
                .filter(|o| !o.status.is_success())
                .map(|o| match &o.error {
                    Some(err) => format!("{}: {}", o.target, err),
                    None => o.target.to_string(),
                })
                .collect();
            Some(format!(
                "{} of {} targets failed: {}",
                failed,
                outcomes.len(),
                detail.join("; ")
            ))
        };
        Self {
            operation_id,
            success: failed == 0,
            status,
            outcomes,
            duration,
            error,
            shared_with: None,
        }
    }

    /// A result for a request that could not be run at all.
    pub fn rejected(operation_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            operation_id,
            success: false,
            status: CleanupStatus::Failure,
            outcomes: Vec::new(),
            duration: Duration::ZERO,
            error: Some(error.into()),
            shared_with: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}
