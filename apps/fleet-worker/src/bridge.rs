//! [`SessionConnector`] backed by an external protocol bridge.
//!
//! One bridge process is spawned per connection attempt. The worker writes
//! JSON lines to its stdin and reads JSON lines describing the session from
//! its stdout:
//!
//! ```text
//! -> {"type":"connect","credentials":{"creds.json":"<base64>"}}
//! -> {"type":"close"}
//! <- {"type":"qr","qr":"2@..."}
//! <- {"type":"open","account":"15550001111"}
//! <- {"type":"close","code":401,"reason":"logged_out","message":"..."}
//! <- {"type":"creds","files":{"creds.json":"<base64>"}}
//! ```
//!
//! A bridge that exits without a `close` line counts as a lost connection.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use fleet_session::{
    CredentialSet, DisconnectReason, SessionConnector, SessionError, SessionEvent,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand {
    Connect {
        credentials: BTreeMap<String, String>,
    },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeMessage {
    Qr {
        qr: String,
    },
    Open {
        #[serde(default)]
        account: Option<String>,
    },
    Close {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Creds {
        files: BTreeMap<String, String>,
    },
}

impl BridgeMessage {
    fn into_event(self) -> Result<SessionEvent, String> {
        match self {
            BridgeMessage::Qr { qr } => {
                if qr.trim().is_empty() {
                    return Err("empty pairing challenge".into());
                }
                Ok(SessionEvent::PairingChallenge(qr))
            }
            BridgeMessage::Open { account } => Ok(SessionEvent::Opened {
                account_id: account.filter(|a| !a.is_empty()),
            }),
            BridgeMessage::Close {
                code,
                reason,
                message,
            } => Ok(SessionEvent::Closed(disconnect_reason(
                code,
                reason.as_deref(),
                message,
            ))),
            BridgeMessage::Creds { files } => {
                let mut set = CredentialSet::new();
                for (name, encoded) in files {
                    let bytes = STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|err| format!("credential {name:?} is not base64: {err}"))?;
                    set.insert(name, bytes);
                }
                Ok(SessionEvent::CredentialsUpdated(set))
            }
        }
    }
}

fn disconnect_reason(
    code: Option<u16>,
    reason: Option<&str>,
    message: Option<String>,
) -> DisconnectReason {
    match reason {
        Some("logged_out") => DisconnectReason::LoggedOut,
        Some("connection_lost") => DisconnectReason::ConnectionLost,
        Some("connection_closed") => DisconnectReason::ConnectionClosed,
        Some("connection_replaced") => DisconnectReason::ConnectionReplaced,
        Some("timed_out") => DisconnectReason::TimedOut,
        Some("restart_required") => DisconnectReason::RestartRequired,
        Some(other) => DisconnectReason::Other {
            code,
            message: message.unwrap_or_else(|| other.to_string()),
        },
        None => match code {
            Some(code) => DisconnectReason::from_status_code(code, message),
            None => DisconnectReason::other(
                message.unwrap_or_else(|| "bridge closed the session".to_string()),
            ),
        },
    }
}

fn encode_credentials(credentials: Option<&CredentialSet>) -> BTreeMap<String, String> {
    credentials
        .map(|set| {
            set.iter()
                .map(|(name, bytes)| (name.to_string(), STANDARD.encode(bytes)))
                .collect()
        })
        .unwrap_or_default()
}

async fn write_line(stdin: &mut ChildStdin, command: &BridgeCommand) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

struct BridgeSession {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

pub struct BridgeConnector {
    command: String,
    workdir: PathBuf,
    session: Option<BridgeSession>,
}

impl BridgeConnector {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            session: None,
        }
    }

    fn spawn(&self) -> Result<Child, SessionError> {
        Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SessionError::protocol(format!(
                    "failed to spawn bridge `{}`: {err}",
                    self.command
                ))
            })
    }

    async fn end_session(&mut self, deliberate: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.reader.abort();

        if !deliberate {
            if let Err(err) = session.child.kill().await {
                debug!(error = %err, "bridge already gone");
            }
            return;
        }

        if let Some(mut stdin) = session.stdin.take() {
            if let Err(err) = write_line(&mut stdin, &BridgeCommand::Close).await {
                debug!(error = %err, "bridge stdin closed before close command");
            }
        }
        match timeout(CLOSE_GRACE, session.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "bridge exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for bridge"),
            Err(_) => {
                warn!("bridge ignored close command; killing it");
                if let Err(err) = session.child.kill().await {
                    warn!(error = %err, "failed to kill bridge");
                }
            }
        }
    }
}

#[async_trait]
impl SessionConnector for BridgeConnector {
    async fn connect(
        &mut self,
        credentials: Option<CredentialSet>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), SessionError> {
        self.end_session(false).await;

        let mut child = self.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::protocol("bridge stdout unavailable"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::protocol("bridge stdin unavailable"))?;
        info!(pid = child.id(), "bridge started");

        let reader = tokio::spawn(read_events(stdout, events));
        let hello = BridgeCommand::Connect {
            credentials: encode_credentials(credentials.as_ref()),
        };
        if let Err(err) = write_line(&mut stdin, &hello).await {
            reader.abort();
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "bridge already gone");
            }
            return Err(SessionError::protocol(format!(
                "failed to hand credentials to bridge: {err}"
            )));
        }

        self.session = Some(BridgeSession {
            child,
            stdin: Some(stdin),
            reader,
        });
        Ok(())
    }

    async fn close(&mut self, deliberate: bool) -> Result<(), SessionError> {
        self.end_session(deliberate).await;
        Ok(())
    }
}

async fn read_events(stdout: ChildStdout, events: mpsc::Sender<SessionEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut closed = false;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read from bridge");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<BridgeMessage>(line) {
            Ok(message) => message,
            Err(_) => {
                debug!(line, "bridge output");
                continue;
            }
        };
        match message.into_event() {
            Ok(event) => {
                closed |= matches!(event, SessionEvent::Closed(_));
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => warn!(error = %err, "ignoring bridge message"),
        }
    }
    if !closed {
        let _ = events
            .send(SessionEvent::Closed(DisconnectReason::ConnectionLost))
            .await;
    }
}
