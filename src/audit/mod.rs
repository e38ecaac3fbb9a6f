//! Append-only, hash-chained security audit trail.
//!
//! Appends go through one mutex so the chain head is never forked. A log
//! that fails verification is never repaired: the auditor switches to a
//! compromised state, refuses further appends and reports the break on the
//! notification bus.

pub mod chain;
pub mod entry;

pub use chain::GENESIS_PREV_HASH;
pub use entry::{
    AuditEventType, AuditFilter, AuditLogEntry, AuditOutcome, AuditRecord, AuditSeverity,
};

use crate::error::AuditError;
use crate::events::{GuardNotification, NotificationBus};
use chain::{ChainLink, ChainVerdict};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

struct ChainState {
    links: Vec<ChainLink>,
    head: String,
    file: Option<File>,
    /// Sequence of the first broken entry once a break was detected.
    broken_at: Option<u64>,
}

pub struct SecurityAuditor {
    path: Option<PathBuf>,
    state: Mutex<ChainState>,
    bus: NotificationBus,
}

impl SecurityAuditor {
    /// Auditor without persistence. Used for tests and `audit_log_path = None`.
    pub fn in_memory(bus: NotificationBus) -> Self {
        Self {
            path: None,
            state: Mutex::new(ChainState {
                links: Vec::new(),
                head: GENESIS_PREV_HASH.to_string(),
                file: None,
                broken_at: None,
            }),
            bus,
        }
    }

    /// Open (or create) a file-backed log. An existing chain is verified
    /// before anything is appended.
    pub fn open(path: impl Into<PathBuf>, bus: NotificationBus) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let (links, verdict) = chain::verify(&data);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let head = links
            .last()
            .map(|link| link.hash.clone())
            .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
        let auditor = Self {
            path: Some(path),
            state: Mutex::new(ChainState {
                links,
                head,
                file: Some(file),
                broken_at: None,
            }),
            bus,
        };

        match verdict {
            ChainVerdict::Intact => {
                info!(
                    path = %auditor.describe_location(),
                    entries = auditor.len(),
                    "Audit log opened, chain intact"
                );
            }
            ChainVerdict::Broken { sequence } => {
                let mut state = auditor.state.lock();
                auditor.mark_broken(&mut state, sequence);
            }
        }
        Ok(auditor)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compromised(&self) -> bool {
        self.state.lock().broken_at.is_some()
    }

    /// Hash of the newest entry, or the genesis value for an empty log.
    pub fn head_hash(&self) -> String {
        self.state.lock().head.clone()
    }

    /// Append one entry to the chain.
    pub fn record(&self, record: AuditRecord) -> Result<AuditLogEntry, AuditError> {
        let mut state = self.state.lock();
        if let Some(sequence) = state.broken_at {
            return Err(AuditError::IntegrityBroken { sequence });
        }

        let entry = AuditLogEntry {
            sequence: state.links.len() as u64,
            timestamp: Utc::now(),
            event_type: record.event_type,
            actor: record.actor,
            outcome: record.outcome,
            severity: record.severity,
            details: record.details,
            prev_hash: state.head.clone(),
        };
        let json = serde_json::to_string(&entry)?;
        let hash = chain::chain_hash(&state.head, json.as_bytes());

        let appended = match state.file.as_mut() {
            Some(file) => append_line(file, &chain::encode_line(&hash, &json)),
            None => Ok(()),
        };
        if let Err(failure) = appended {
            if failure.torn {
                self.mark_broken(&mut state, entry.sequence);
            }
            return Err(failure.error.into());
        }

        debug!(
            sequence = entry.sequence,
            event = ?entry.event_type,
            severity = ?entry.severity,
            "Audit entry recorded"
        );
        state.head = hash.clone();
        state.links.push(ChainLink {
            entry: entry.clone(),
            hash,
            json,
        });
        Ok(entry)
    }

    /// Entries matching `filter`, oldest first. With a limit, the most
    /// recent matches are kept.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let state = self.state.lock();
        let mut matches: Vec<AuditLogEntry> = state
            .links
            .iter()
            .map(|link| &link.entry)
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }

    /// Recompute the chain from the first entry forward.
    ///
    /// File-backed logs are re-read from disk so that edits made behind the
    /// auditor's back are caught.
    pub fn verify_chain_integrity(&self) -> bool {
        let mut state = self.state.lock();
        if state.broken_at.is_some() {
            return false;
        }

        let data = match &self.path {
            Some(path) => match fs::read(path) {
                Ok(data) => data,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Audit log unreadable");
                    self.mark_broken(&mut state, 0);
                    return false;
                }
            },
            None => state
                .links
                .iter()
                .flat_map(|link| chain::encode_line(&link.hash, &link.json).into_bytes())
                .collect(),
        };

        let (links, verdict) = chain::verify(&data);
        match verdict {
            ChainVerdict::Broken { sequence } => {
                self.mark_broken(&mut state, sequence);
                false
            }
            // Truncation leaves a valid prefix; a shorter chain than we wrote
            // is still a break.
            ChainVerdict::Intact if links.len() < state.links.len() => {
                let sequence = links.len() as u64;
                self.mark_broken(&mut state, sequence);
                false
            }
            ChainVerdict::Intact => true,
        }
    }

    fn mark_broken(&self, state: &mut ChainState, sequence: u64) {
        if state.broken_at.is_some() {
            return;
        }
        state.broken_at = Some(sequence);
        error!(
            path = %self.describe_location(),
            sequence,
            "SECURITY: audit chain integrity broken; log will not be repaired or extended"
        );
        self.bus
            .publish(GuardNotification::AuditIntegrityBroken { sequence });
    }

    fn describe_location(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }
}

/// Append-only destination for encoded chain lines.
trait LineSink: Write {
    fn end_offset(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LineSink for File {
    fn end_offset(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

struct AppendFailure {
    error: io::Error,
    /// A partial line may remain on disk.
    torn: bool,
}

/// Write one whole line or nothing: a failed write is cut back to the
/// previous end of the log.
fn append_line(sink: &mut impl LineSink, line: &str) -> Result<(), AppendFailure> {
    let start = sink.end_offset().map_err(|error| AppendFailure { error, torn: false })?;
    let written = sink
        .write_all(line.as_bytes())
        .and_then(|()| sink.flush())
        .and_then(|()| sink.sync());
    let Err(error) = written else {
        return Ok(());
    };
    match sink.truncate_to(start).and_then(|()| sink.sync()) {
        Ok(()) => {
            warn!(error = %error, "Audit append failed; partial line removed");
            Err(AppendFailure { error, torn: false })
        }
        Err(truncate) => {
            error!(error = %error, truncate_error = %truncate, "Audit append failed and could not be rolled back");
            Err(AppendFailure { error, torn: true })
        }
    }
}

impl std::fmt::Debug for SecurityAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityAuditor")
            .field("path", &self.path)
            .field("entries", &self.len())
            .field("compromised", &self.is_compromised())
            .finish()
    }
}
