//! Worker info surface.
//!
//! A small JSON document the worker rewrites on every phase change. It is the
//! only way the control plane learns about a worker's connection state or the
//! account the session resolved to.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{fsio, ConnectionPhase, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub instance: String,
    pub phase: ConnectionPhase,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub reconnect_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

impl WorkerReport {
    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }
}

#[derive(Debug, Clone)]
pub struct InfoSurface {
    path: PathBuf,
}

impl InfoSurface {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, report: &WorkerReport) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec_pretty(report).map_err(|source| {
            SessionError::MalformedReport {
                path: self.path.clone(),
                source,
            }
        })?;
        fsio::write_atomic(&self.path, &bytes)
    }

    pub fn read(&self) -> Result<Option<WorkerReport>, SessionError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SessionError::MalformedReport {
                path: self.path.clone(),
                source,
            })
    }

    /// Account id recorded by a previous worker, if any.
    pub fn last_account(&self) -> Option<String> {
        self.read().ok().flatten().and_then(|report| report.account_id)
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        fsio::remove_if_exists(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(account: Option<&str>) -> WorkerReport {
        WorkerReport {
            instance: "sales".into(),
            phase: ConnectionPhase::Open,
            terminal: false,
            reconnect_attempt: 0,
            account_id: account.map(str::to_string),
            last_error: None,
            pid: 4242,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let surface = InfoSurface::new(tmp.path().join("worker.json"));
        assert_eq!(surface.read().unwrap(), None);

        let written = report(Some("15550001111"));
        surface.write(&written).unwrap();
        assert_eq!(surface.read().unwrap(), Some(written));
        assert_eq!(surface.last_account().as_deref(), Some("15550001111"));
    }

    #[test]
    fn phase_is_snake_case_on_disk() {
        let json = serde_json::to_value(report(None)).unwrap();
        assert_eq!(json["phase"], "open");
        assert!(json.get("account_id").is_none());
    }

    #[test]
    fn garbage_is_reported_as_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("worker.json");
        std::fs::write(&path, "not json").unwrap();
        let surface = InfoSurface::new(&path);
        assert!(matches!(
            surface.read(),
            Err(SessionError::MalformedReport { .. })
        ));
        assert_eq!(surface.last_account(), None);
    }
}
