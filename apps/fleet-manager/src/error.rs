use std::path::PathBuf;

use fleet_sdk::InstanceId;
use fleet_session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),
    #[error("an instance named {0:?} already exists")]
    AlreadyExists(String),
    #[error("instance {0:?} is already running")]
    AlreadyRunning(String),
    #[error("invalid instance name {0:?}: use letters, digits, '-' or '_'")]
    InvalidName(String),
    #[error("no repository given and DEFAULT_REPO_URL is not configured")]
    MissingRepository,
    #[error("source control failed: {0}")]
    SourceControl(String),
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("failed to stop worker {pid}: {reason}")]
    Stop { pid: u32, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry is corrupt: {0}")]
    Registry(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SupervisorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            path: path.into(),
            source,
        }
    }
}
