//! Pairing challenge channel.
//!
//! Holds at most the latest challenge. The worker publishes on every challenge
//! rotation and clears once the session opens or closes; the control plane
//! reads with a freshness bound because an abandoned file outlives its worth.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::debug;

use crate::{fsio, SessionError};

/// Challenges older than this are treated as absent by readers.
pub const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingChallenge {
    pub value: String,
    pub published_at: SystemTime,
}

impl PairingChallenge {
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.published_at)
            .unwrap_or_default()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

#[derive(Debug, Clone)]
pub struct PairingChannel {
    path: PathBuf,
}

impl PairingChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces whatever challenge was published before.
    pub fn publish(&self, challenge: &str) -> Result<(), SessionError> {
        fsio::write_atomic(&self.path, challenge.as_bytes())?;
        debug!(path = %self.path.display(), "pairing challenge published");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        fsio::remove_if_exists(&self.path)
    }

    pub fn read(&self) -> Result<Option<PairingChallenge>, SessionError> {
        let value = match fs::read_to_string(&self.path) {
            Ok(value) => value,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            return Ok(None);
        }
        let published_at = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|err| SessionError::io(&self.path, err))?;
        Ok(Some(PairingChallenge {
            value,
            published_at,
        }))
    }

    /// Returns the challenge only while it is younger than `max_age`.
    pub fn read_fresh(&self, max_age: Duration) -> Result<Option<String>, SessionError> {
        Ok(self
            .read()?
            .filter(|challenge| !challenge.is_stale(max_age))
            .map(|challenge| challenge.value))
    }
}
