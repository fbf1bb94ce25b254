//! Boundary to the opaque chat-protocol client.
//!
//! The driver never sees handshakes or transport details. A connector opens a
//! session and reports what happened to it as [`SessionEvent`]s on the channel
//! it was handed.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CredentialSet, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    TimedOut,
    RestartRequired,
    Other {
        #[serde(default)]
        code: Option<u16>,
        message: String,
    },
}

impl DisconnectReason {
    /// Only an explicit logout invalidates the session for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }

    /// Maps the status codes protocol clients attach to disconnects.
    pub fn from_status_code(code: u16, message: Option<String>) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 => DisconnectReason::TimedOut,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            515 => DisconnectReason::RestartRequired,
            _ => DisconnectReason::Other {
                code: Some(code),
                message: message.unwrap_or_else(|| format!("disconnected with status {code}")),
            },
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        DisconnectReason::Other {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => f.write_str("logged out"),
            DisconnectReason::ConnectionLost => f.write_str("connection lost"),
            DisconnectReason::ConnectionClosed => f.write_str("connection closed"),
            DisconnectReason::ConnectionReplaced => f.write_str("connection replaced"),
            DisconnectReason::TimedOut => f.write_str("timed out"),
            DisconnectReason::RestartRequired => f.write_str("restart required"),
            DisconnectReason::Other {
                code: Some(code),
                message,
            } => write!(f, "{message} (status {code})"),
            DisconnectReason::Other { code: None, message } => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A pairing challenge is available because no valid credentials exist.
    PairingChallenge(String),
    /// The session is live.
    Opened { account_id: Option<String> },
    Closed(DisconnectReason),
    /// The protocol rotated some or all credential entries.
    CredentialsUpdated(CredentialSet),
}

#[async_trait]
pub trait SessionConnector: Send {
    /// Opens a session, replacing any previous one owned by this connector.
    /// Everything that happens afterwards is reported on `events`.
    async fn connect(
        &mut self,
        credentials: Option<CredentialSet>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), SessionError>;

    /// Closes the current session. A deliberate close must not be followed by
    /// a `Closed` event for the same session.
    async fn close(&mut self, deliberate: bool) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_logout_is_terminal() {
        assert!(DisconnectReason::LoggedOut.is_terminal());
        for reason in [
            DisconnectReason::ConnectionLost,
            DisconnectReason::ConnectionClosed,
            DisconnectReason::ConnectionReplaced,
            DisconnectReason::TimedOut,
            DisconnectReason::RestartRequired,
            DisconnectReason::other("socket hang up"),
        ] {
            assert!(!reason.is_terminal(), "{reason} must not be terminal");
        }
    }

    #[test]
    fn status_codes_map_to_reasons() {
        assert_eq!(
            DisconnectReason::from_status_code(401, None),
            DisconnectReason::LoggedOut
        );
        assert_eq!(
            DisconnectReason::from_status_code(515, None),
            DisconnectReason::RestartRequired
        );
        assert_eq!(
            DisconnectReason::from_status_code(500, Some("bad session".into())),
            DisconnectReason::Other {
                code: Some(500),
                message: "bad session".into()
            }
        );
    }

    #[test]
    fn reason_serializes_with_kind_tag() {
        let json = serde_json::to_value(DisconnectReason::LoggedOut).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "logged_out" }));
        let parsed: DisconnectReason =
            serde_json::from_str(r#"{"kind":"other","message":"boom"}"#).unwrap();
        assert_eq!(parsed, DisconnectReason::other("boom"));
    }
}
