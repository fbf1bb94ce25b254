//! PID marker for the privileged instance.
//!
//! The marker lets the control plane detect a live privileged worker without
//! any bookkeeping of its own. The worker writes it at startup and removes it
//! on shutdown; [`PidMarker`] also removes it on drop so a normal exit cleans
//! up even when no signal was involved.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::{fsio, SessionError};

/// Writes `pid` to `path`, creating parent directories as needed.
pub fn write(path: &Path, pid: u32) -> Result<(), SessionError> {
    fsio::write_atomic(path, pid.to_string().as_bytes())
}

/// Returns `None` if the marker is missing or unparseable.
pub fn read(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Removing an absent marker is not an error.
pub fn remove(path: &Path) -> Result<(), SessionError> {
    fsio::remove_if_exists(path)
}

#[derive(Debug)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    /// Records the current process id at `path`.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let pid = std::process::id();
        write(&path, pid)?;
        info!(path = %path.display(), pid, "wrote pid marker");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&self) {
        // Only remove a marker that still names this process.
        if read(&self.path).is_some_and(|pid| pid != std::process::id()) {
            return;
        }
        if let Err(err) = remove(&self.path) {
            warn!(error = %err, "failed to remove pid marker");
        }
    }
}

impl Drop for PidMarker {
    fn drop(&mut self) {
        self.release();
    }
}
