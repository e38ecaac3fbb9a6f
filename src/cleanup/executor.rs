//! Performs a single leaf cleanup target.
//!
//! Every operation is idempotent: erasing something that is already gone
//! reports [`ExecOutcome::AlreadyClean`], never an error.

use crate::cleanup::operation::CleanupTarget;
use crate::cleanup::registry::SensitiveRegistry;
use crate::error::CleanupError;
use crate::platform::{self, Termination};
use crate::secure::WipeOutcome;
use crate::utils::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ZERO_CHUNK: [u8; 8192] = [0u8; 8192];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Cleaned,
    AlreadyClean,
}

/// Blocking executor for one leaf target. Called from a blocking thread.
pub trait TargetExecutor: Send + Sync {
    fn execute(&self, target: &CleanupTarget) -> Result<ExecOutcome, CleanupError>;
}

/// Executor acting on the real process, environment and filesystem.
pub struct SystemExecutor {
    registry: Arc<SensitiveRegistry>,
    process_grace: Duration,
}

impl SystemExecutor {
    pub fn new(registry: Arc<SensitiveRegistry>, process_grace: Duration) -> Self {
        Self {
            registry,
            process_grace,
        }
    }

    fn wipe_handle(&self, id: crate::secure::HandleId) -> ExecOutcome {
        match self.registry.handle(id) {
            Some(handle) => match handle.wipe() {
                WipeOutcome::Wiped => ExecOutcome::Cleaned,
                WipeOutcome::AlreadyWiped => ExecOutcome::AlreadyClean,
            },
            // Dropped handles were zeroized on drop.
            None => ExecOutcome::AlreadyClean,
        }
    }

    fn unset_variable(&self, name: &str) -> Result<ExecOutcome, CleanupError> {
        if !env::is_valid_name(name) {
            return Err(CleanupError::InvalidTarget(format!(
                "environment variable name {:?}",
                name
            )));
        }
        if env::remove(name) {
            Ok(ExecOutcome::Cleaned)
        } else {
            Ok(ExecOutcome::AlreadyClean)
        }
    }

    fn delete_files(&self, pattern: &Path) -> Result<ExecOutcome, CleanupError> {
        let paths = expand(pattern)?;
        let mut outcome = ExecOutcome::AlreadyClean;
        for path in paths {
            if secure_delete(&path)? == ExecOutcome::Cleaned {
                outcome = ExecOutcome::Cleaned;
            }
        }
        Ok(outcome)
    }

    fn terminate(&self, pid: u32) -> Result<ExecOutcome, CleanupError> {
        if pid == std::process::id() {
            return Err(CleanupError::InvalidTarget("refusing to terminate self".to_string()));
        }
        match platform::terminate_process(pid, self.process_grace)? {
            Termination::AlreadyGone => Ok(ExecOutcome::AlreadyClean),
            Termination::Graceful | Termination::Forced => Ok(ExecOutcome::Cleaned),
        }
    }
}

impl TargetExecutor for SystemExecutor {
    fn execute(&self, target: &CleanupTarget) -> Result<ExecOutcome, CleanupError> {
        match target {
            CleanupTarget::Memory(id) => Ok(self.wipe_handle(*id)),
            CleanupTarget::EnvironmentVariable(name) => self.unset_variable(name),
            CleanupTarget::ConfigFile(path) => self.delete_files(path),
            CleanupTarget::Process { pid } => self.terminate(*pid),
            CleanupTarget::Composite(_) => Err(CleanupError::InvalidTarget(
                "composite targets are executed leaf by leaf".to_string(),
            )),
        }
    }
}

pub(crate) fn is_glob(path: &Path) -> bool {
    path.to_string_lossy()
        .chars()
        .any(|c| matches!(c, '*' | '?' | '['))
}

/// Paths currently matching `pattern`: the path itself, or the glob matches.
pub(crate) fn expand(pattern: &Path) -> Result<Vec<PathBuf>, CleanupError> {
    if !is_glob(pattern) {
        return Ok(vec![pattern.to_path_buf()]);
    }
    let text = pattern.to_string_lossy();
    let matches = glob::glob(&text).map_err(|e| {
        CleanupError::InvalidTarget(format!("file pattern {}: {}", text, e.msg))
    })?;
    let mut paths = Vec::new();
    for entry in matches {
        match entry {
            Ok(path) => paths.push(path),
            Err(err) => return Err(CleanupError::from_io(err.path(), err.error())),
        }
    }
    Ok(paths)
}

/// Overwrite a regular file with zeros, flush it to disk and unlink it.
fn secure_delete(path: &Path) -> Result<ExecOutcome, CleanupError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ExecOutcome::AlreadyClean),
        Err(err) => return Err(CleanupError::from_io(path, &err)),
    };

    if metadata.is_dir() {
        return Err(CleanupError::InvalidTarget(format!(
            "{} is a directory",
            path.display()
        )));
    }

    // Symlinks are unlinked without touching their target.
    if metadata.is_file() {
        overwrite_with_zeros(path, metadata.len()).map_err(|e| CleanupError::from_io(path, &e))?;
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(ExecOutcome::Cleaned),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ExecOutcome::AlreadyClean),
        Err(err) => Err(CleanupError::from_io(path, &err)),
    }
}

fn overwrite_with_zeros(path: &Path, len: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(ZERO_CHUNK.len() as u64) as usize;
        file.write_all(&ZERO_CHUNK[..chunk])?;
        remaining -= chunk as u64;
    }
    file.sync_all()
}
