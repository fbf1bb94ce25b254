//! Per-instance connection lifecycle for fleet workers.
//!
//! A worker process hosts exactly one [`SessionDriver`], which owns the
//! [`ConnectionMachine`] for its instance and binds it to the opaque protocol
//! client behind [`SessionConnector`]. Everything the control plane needs to
//! observe is published through small per-instance files:
//!
//! * [`PairingChannel`]: the latest pairing challenge, if one is outstanding.
//! * [`CredentialStore`]: the durable credential blob set.
//! * [`InfoSurface`]: the worker's phase, reconnect attempt and account id.
//! * [`marker`]: the PID marker of the privileged instance.

pub mod backoff;
pub mod credentials;
pub mod driver;
mod fsio;
pub mod info;
pub mod machine;
pub mod marker;
pub mod pairing;
pub mod protocol;

use std::path::PathBuf;

use thiserror::Error;

pub use backoff::ReconnectPolicy;
pub use credentials::{CredentialSet, CredentialStore};
pub use driver::{SessionDriver, SessionPaths};
pub use info::{InfoSurface, WorkerReport};
pub use machine::{Action, ConnectionMachine, ConnectionPhase, MachineInput};
pub use pairing::{PairingChallenge, PairingChannel, CHALLENGE_MAX_AGE};
pub use protocol::{DisconnectReason, SessionConnector, SessionEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credential entry name {0:?}")]
    InvalidCredentialName(String),
    #[error("malformed worker report at {path}: {source}")]
    MalformedReport {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SessionError::Protocol(message.into())
    }
}
