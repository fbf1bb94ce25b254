//! Async driver binding a [`ConnectionMachine`] to a [`SessionConnector`].
//!
//! The driver is a single task: protocol events, the reconnect timer and the
//! shutdown token are multiplexed by one `select!`, so at most one transition
//! is in flight and no locking is needed.

use std::{collections::VecDeque, future::Future, path::PathBuf, pin::Pin};

use tokio::{
    sync::mpsc,
    time::{sleep, Sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    Action, ConnectionMachine, ConnectionPhase, CredentialSet, CredentialStore, DisconnectReason,
    InfoSurface, MachineInput, PairingChannel, ReconnectPolicy, SessionConnector, SessionError,
    SessionEvent,
};

const EVENT_BUFFER: usize = 64;

type PreCloseHook = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Files through which a worker exposes its session to the control plane.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub credentials_dir: PathBuf,
    pub challenge_file: PathBuf,
    pub info_file: PathBuf,
}

impl SessionPaths {
    /// Default layout inside an instance directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            credentials_dir: dir.join("auth_info"),
            challenge_file: dir.join("qr.txt"),
            info_file: dir.join("worker.json"),
        }
    }
}

pub struct SessionDriver<C> {
    instance: String,
    pid: u32,
    machine: ConnectionMachine,
    connector: C,
    credentials: CredentialStore,
    pairing: PairingChannel,
    info: InfoSurface,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    reconnect: Option<Pin<Box<Sleep>>>,
    connected_once: bool,
    pre_close: Option<PreCloseHook>,
}

impl<C: SessionConnector> SessionDriver<C> {
    pub fn new(
        instance: impl Into<String>,
        paths: SessionPaths,
        policy: ReconnectPolicy,
        connector: C,
    ) -> Self {
        let info = InfoSurface::new(paths.info_file);
        let machine = ConnectionMachine::new(policy).with_account(info.last_account());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            instance: instance.into(),
            pid: std::process::id(),
            machine,
            connector,
            credentials: CredentialStore::new(paths.credentials_dir),
            pairing: PairingChannel::new(paths.challenge_file),
            info,
            events_tx,
            events_rx,
            reconnect: None,
            connected_once: false,
            pre_close: None,
        }
    }

    /// Work to finish after the reconnect timer is cancelled but before the
    /// session is closed on shutdown.
    pub fn before_close<F>(mut self, hook: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pre_close = Some(Box::pin(hook));
        self
    }

    pub fn machine(&self) -> &ConnectionMachine {
        &self.machine
    }

    /// Runs until `shutdown` is cancelled and the session has been closed.
    ///
    /// Fails only when the very first connection attempt cannot be made, i.e.
    /// the session could not be constructed at all.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConnectionPhase, SessionError> {
        info!(instance = %self.instance, "starting session");
        let actions = self.machine.handle(MachineInput::Start);
        self.apply(actions).await?;

        loop {
            if self.machine.is_shutting_down() {
                break;
            }
            let input = tokio::select! {
                _ = shutdown.cancelled() => MachineInput::Shutdown,
                Some(event) = self.events_rx.recv() => MachineInput::Session(event),
                _ = reconnect_elapsed(&mut self.reconnect) => {
                    self.reconnect = None;
                    MachineInput::ReconnectDue
                }
            };
            let actions = self.machine.handle(input);
            self.apply(actions).await?;
        }

        // Credential rotations that raced the close still land on disk.
        while let Ok(event) = self.events_rx.try_recv() {
            if let SessionEvent::CredentialsUpdated(set) = event {
                self.persist_credentials(&set);
            }
        }

        info!(instance = %self.instance, "session stopped");
        Ok(self.machine.phase())
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<(), SessionError> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect => {
                    if let Err(err) = self.connect().await {
                        if !self.connected_once {
                            error!(instance = %self.instance, error = %err, "session could not be constructed");
                            return Err(err);
                        }
                        warn!(instance = %self.instance, error = %err, "connect failed");
                        let reason = DisconnectReason::other(err.to_string());
                        queue.extend(
                            self.machine
                                .handle(MachineInput::Session(SessionEvent::Closed(reason))),
                        );
                    }
                }
                Action::PublishChallenge(challenge) => {
                    if let Err(err) = self.pairing.publish(&challenge) {
                        warn!(instance = %self.instance, error = %err, "failed to publish pairing challenge");
                    } else {
                        info!(instance = %self.instance, "pairing challenge available");
                    }
                }
                Action::ClearChallenge => {
                    if let Err(err) = self.pairing.clear() {
                        warn!(instance = %self.instance, error = %err, "failed to clear pairing challenge");
                    }
                }
                Action::PersistCredentials(set) => self.persist_credentials(&set),
                Action::RecordAccount(account) => {
                    info!(instance = %self.instance, account = %account, "session resolved account");
                    self.write_report();
                }
                Action::ScheduleReconnect { delay, .. } => {
                    self.reconnect = Some(Box::pin(sleep(delay)));
                }
                Action::CancelReconnect => {
                    self.reconnect = None;
                }
                Action::CloseSession { deliberate } => {
                    if deliberate {
                        if let Some(hook) = self.pre_close.take() {
                            hook.await;
                        }
                    }
                    if let Err(err) = self.connector.close(deliberate).await {
                        warn!(instance = %self.instance, error = %err, "session close failed");
                    }
                }
                Action::Report => self.write_report(),
            }
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let credentials = match self.credentials.load() {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(instance = %self.instance, error = %err, "failed to load credentials; pairing from scratch");
                None
            }
        };
        info!(
            instance = %self.instance,
            stored_credentials = credentials.is_some(),
            attempt = self.machine.reconnect_attempt(),
            "connecting"
        );
        self.connector
            .connect(credentials, self.events_tx.clone())
            .await?;
        self.connected_once = true;
        Ok(())
    }

    fn persist_credentials(&self, set: &CredentialSet) {
        if let Err(err) = self.credentials.save(set) {
            error!(instance = %self.instance, error = %err, "failed to persist rotated credentials");
        }
    }

    fn write_report(&self) {
        let report = self.machine.report(&self.instance, self.pid);
        if let Err(err) = self.info.write(&report) {
            warn!(instance = %self.instance, error = %err, "failed to write worker report");
        }
    }
}

async fn reconnect_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}
