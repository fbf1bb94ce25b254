//! Connection state machine.
//!
//! ```text
//!   start ──► connecting ──challenge──► awaiting_pairing
//!                 │  ▲                        │
//!                 │  └──── reconnect due ─────┼──────────────┐
//!               opened                      opened           │
//!                 ▼                           ▼              │
//!                open ───── disconnect ────► closed ─────────┘ (non-terminal, backoff)
//!                                              │
//!                                              └─► terminal (logout, attempts exhausted, shutdown)
//! ```
//!
//! The machine performs no IO. Each input yields the list of [`Action`]s the
//! driver must carry out, in order.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CredentialSet, DisconnectReason, ReconnectPolicy, SessionEvent, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    AwaitingPairing,
    Open,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::AwaitingPairing => "awaiting_pairing",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineInput {
    Start,
    Session(SessionEvent),
    ReconnectDue,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a session using whatever the credential store currently holds.
    Connect,
    PublishChallenge(String),
    ClearChallenge,
    PersistCredentials(CredentialSet),
    RecordAccount(String),
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    CloseSession { deliberate: bool },
    /// Rewrite the worker info surface from the current state.
    Report,
}

pub const ATTEMPTS_EXHAUSTED: &str = "reconnect attempts exhausted";

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    terminal: bool,
    challenge: Option<String>,
    reconnect_attempt: u32,
    reconnect_pending: bool,
    shutting_down: bool,
    account_id: Option<String>,
    last_error: Option<String>,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Connecting,
            terminal: false,
            challenge: None,
            reconnect_attempt: 0,
            reconnect_pending: false,
            shutting_down: false,
            account_id: None,
            last_error: None,
        }
    }

    /// Seeds the account id known from a previous process lifetime.
    pub fn with_account(mut self, account_id: Option<String>) -> Self {
        self.account_id = account_id;
        self
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn report(&self, instance: &str, pid: u32) -> WorkerReport {
        WorkerReport {
            instance: instance.to_string(),
            phase: self.phase,
            terminal: self.terminal,
            reconnect_attempt: self.reconnect_attempt,
            account_id: self.account_id.clone(),
            last_error: self.last_error.clone(),
            pid,
            updated_at: Utc::now(),
        }
    }

    pub fn handle(&mut self, input: MachineInput) -> Vec<Action> {
        match input {
            MachineInput::Start => self.on_start(),
            MachineInput::Session(SessionEvent::PairingChallenge(value)) => self.on_challenge(value),
            MachineInput::Session(SessionEvent::Opened { account_id }) => self.on_open(account_id),
            MachineInput::Session(SessionEvent::Closed(reason)) => self.on_close(reason),
            MachineInput::Session(SessionEvent::CredentialsUpdated(set)) => {
                // Rotations are persisted in every phase, shutdown included.
                vec![Action::PersistCredentials(set)]
            }
            MachineInput::ReconnectDue => self.on_reconnect_due(),
            MachineInput::Shutdown => self.on_shutdown(),
        }
    }

    fn on_start(&mut self) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        self.phase = ConnectionPhase::Connecting;
        self.terminal = false;
        vec![Action::Connect, Action::Report]
    }

    fn on_challenge(&mut self, value: String) -> Vec<Action> {
        if self.shutting_down || self.terminal {
            return Vec::new();
        }
        if !matches!(
            self.phase,
            ConnectionPhase::Connecting | ConnectionPhase::AwaitingPairing
        ) {
            debug!(phase = ?self.phase, "ignoring pairing challenge outside of connect");
            return Vec::new();
        }
        if value.trim().is_empty() {
            warn!("ignoring empty pairing challenge");
            return Vec::new();
        }
        let first = self.phase == ConnectionPhase::Connecting;
        self.phase = ConnectionPhase::AwaitingPairing;
        self.challenge = Some(value.clone());
        let mut actions = vec![Action::PublishChallenge(value)];
        if first {
            actions.push(Action::Report);
        }
        actions
    }

    fn on_open(&mut self, account_id: Option<String>) -> Vec<Action> {
        if self.shutting_down || self.terminal {
            return Vec::new();
        }
        self.phase = ConnectionPhase::Open;
        self.challenge = None;
        self.reconnect_attempt = 0;
        self.last_error = None;

        let mut actions = vec![Action::ClearChallenge];
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        if let Some(account) = account_id.filter(|a| !a.is_empty()) {
            if self.account_id.as_deref() != Some(account.as_str()) {
                self.account_id = Some(account.clone());
                actions.push(Action::RecordAccount(account));
            }
        }
        actions.push(Action::Report);
        actions
    }

    fn on_close(&mut self, reason: DisconnectReason) -> Vec<Action> {
        if self.terminal {
            return Vec::new();
        }
        self.phase = ConnectionPhase::Closed;
        self.challenge = None;
        let mut actions = vec![Action::ClearChallenge];

        if self.shutting_down {
            self.terminal = true;
            actions.push(Action::Report);
            return actions;
        }

        self.last_error = Some(reason.to_string());
        if reason.is_terminal() {
            info!(%reason, "session closed terminally; not reconnecting");
            self.terminal = true;
            if self.reconnect_pending {
                self.reconnect_pending = false;
                actions.push(Action::CancelReconnect);
            }
            actions.push(Action::Report);
            return actions;
        }

        if self.reconnect_pending {
            debug!(%reason, "reconnect already pending");
            actions.push(Action::Report);
            return actions;
        }

        let attempt = self.reconnect_attempt.saturating_add(1);
        if !self.policy.allows(attempt) {
            warn!(%reason, attempts = self.reconnect_attempt, "giving up on reconnect");
            self.terminal = true;
            self.last_error = Some(ATTEMPTS_EXHAUSTED.to_string());
            actions.push(Action::Report);
            return actions;
        }

        self.reconnect_attempt = attempt;
        self.reconnect_pending = true;
        let delay = self.policy.delay_for_attempt(attempt);
        info!(%reason, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        actions.push(Action::ScheduleReconnect { attempt, delay });
        actions.push(Action::Report);
        actions
    }

    fn on_reconnect_due(&mut self) -> Vec<Action> {
        if !self.reconnect_pending || self.shutting_down || self.terminal {
            return Vec::new();
        }
        self.reconnect_pending = false;
        self.phase = ConnectionPhase::Connecting;
        vec![Action::Connect, Action::Report]
    }

    fn on_shutdown(&mut self) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;

        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        self.reconnect_attempt = 0;
        actions.push(Action::CloseSession { deliberate: true });
        self.challenge = None;
        actions.push(Action::ClearChallenge);
        self.phase = ConnectionPhase::Closed;
        self.terminal = true;
        actions.push(Action::Report);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::default())
    }

    fn session(event: SessionEvent) -> MachineInput {
        MachineInput::Session(event)
    }

    fn opened(account: Option<&str>) -> MachineInput {
        session(SessionEvent::Opened {
            account_id: account.map(str::to_string),
        })
    }

    fn closed(reason: DisconnectReason) -> MachineInput {
        session(SessionEvent::Closed(reason))
    }

    fn scheduled(actions: &[Action]) -> Vec<(u32, Duration)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::ScheduleReconnect { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_start_pairs_then_opens() {
        let mut m = machine();
        assert_eq!(m.handle(MachineInput::Start), vec![Action::Connect, Action::Report]);

        let actions = m.handle(session(SessionEvent::PairingChallenge("2@abc".into())));
        assert_eq!(m.phase(), ConnectionPhase::AwaitingPairing);
        assert_eq!(m.challenge(), Some("2@abc"));
        assert_eq!(
            actions,
            vec![Action::PublishChallenge("2@abc".into()), Action::Report]
        );

        // Rotation while waiting overwrites without a phase change.
        let actions = m.handle(session(SessionEvent::PairingChallenge("2@def".into())));
        assert_eq!(actions, vec![Action::PublishChallenge("2@def".into())]);

        let actions = m.handle(opened(Some("15550001111")));
        assert_eq!(m.phase(), ConnectionPhase::Open);
        assert_eq!(m.challenge(), None);
        assert_eq!(m.reconnect_attempt(), 0);
        assert_eq!(
            actions,
            vec![
                Action::ClearChallenge,
                Action::RecordAccount("15550001111".into()),
                Action::Report
            ]
        );
    }

    #[test]
    fn nth_reconnect_delay_follows_backoff() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(opened(None));

        for n in 1..=12u32 {
            let actions = m.handle(closed(DisconnectReason::ConnectionLost));
            let expected = Duration::from_millis(u64::from((2_000 * n).min(20_000)));
            assert_eq!(scheduled(&actions), vec![(n, expected)]);
            assert_eq!(m.phase(), ConnectionPhase::Closed);
            assert!(m.reconnect_pending());

            assert_eq!(
                m.handle(MachineInput::ReconnectDue),
                vec![Action::Connect, Action::Report]
            );
            assert_eq!(m.phase(), ConnectionPhase::Connecting);
        }
    }

    #[test]
    fn only_one_timer_is_pending() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(opened(None));

        let first = m.handle(closed(DisconnectReason::ConnectionLost));
        assert_eq!(scheduled(&first), vec![(1, Duration::from_secs(2))]);

        let second = m.handle(closed(DisconnectReason::TimedOut));
        assert!(scheduled(&second).is_empty());
        assert_eq!(m.reconnect_attempt(), 1);
    }

    #[test]
    fn second_disconnect_after_reconnect_uses_attempt_two() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(opened(None));

        let actions = m.handle(closed(DisconnectReason::ConnectionClosed));
        assert_eq!(scheduled(&actions), vec![(1, Duration::from_millis(2_000))]);
        m.handle(MachineInput::ReconnectDue);

        let actions = m.handle(closed(DisconnectReason::ConnectionClosed));
        assert_eq!(scheduled(&actions), vec![(2, Duration::from_millis(4_000))]);
    }

    #[test]
    fn logout_never_reconnects() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(opened(None));
        m.handle(closed(DisconnectReason::ConnectionLost));
        m.handle(MachineInput::ReconnectDue);
        m.handle(closed(DisconnectReason::ConnectionLost));
        assert_eq!(m.reconnect_attempt(), 2);

        let actions = m.handle(closed(DisconnectReason::LoggedOut));
        assert!(scheduled(&actions).is_empty());
        assert!(actions.contains(&Action::CancelReconnect));
        assert!(m.is_terminal());
        assert!(!m.reconnect_pending());

        assert!(m.handle(MachineInput::ReconnectDue).is_empty());
        assert!(m.handle(closed(DisconnectReason::ConnectionLost)).is_empty());
        assert!(m.handle(opened(None)).is_empty());
    }

    #[test]
    fn open_resets_attempts_and_cancels_pending_timer() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(closed(DisconnectReason::ConnectionLost));
        m.handle(MachineInput::ReconnectDue);
        m.handle(closed(DisconnectReason::ConnectionLost));
        assert_eq!(m.reconnect_attempt(), 2);

        let actions = m.handle(opened(None));
        assert_eq!(m.reconnect_attempt(), 0);
        assert!(actions.contains(&Action::CancelReconnect));
        assert!(actions.contains(&Action::ClearChallenge));

        let actions = m.handle(closed(DisconnectReason::ConnectionLost));
        assert_eq!(scheduled(&actions), vec![(1, Duration::from_secs(2))]);
    }

    #[test]
    fn close_while_awaiting_pairing_clears_challenge() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(session(SessionEvent::PairingChallenge("qr".into())));
        let actions = m.handle(closed(DisconnectReason::TimedOut));
        assert_eq!(m.challenge(), None);
        assert_eq!(actions[0], Action::ClearChallenge);
        assert_eq!(scheduled(&actions), vec![(1, Duration::from_secs(2))]);
    }

    #[test]
    fn challenge_is_ignored_once_open() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(opened(None));
        assert!(m
            .handle(session(SessionEvent::PairingChallenge("late".into())))
            .is_empty());
        assert_eq!(m.challenge(), None);
    }

    #[test]
    fn bounded_attempts_turn_terminal() {
        let mut m = ConnectionMachine::new(ReconnectPolicy::default().with_max_attempts(Some(2)));
        m.handle(MachineInput::Start);
        m.handle(closed(DisconnectReason::ConnectionLost));
        m.handle(MachineInput::ReconnectDue);
        m.handle(closed(DisconnectReason::ConnectionLost));
        m.handle(MachineInput::ReconnectDue);

        let actions = m.handle(closed(DisconnectReason::ConnectionLost));
        assert!(scheduled(&actions).is_empty());
        assert!(m.is_terminal());
        assert_eq!(m.last_error(), Some(ATTEMPTS_EXHAUSTED));
    }

    #[test]
    fn shutdown_cancels_timer_before_close_and_is_idempotent() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        m.handle(closed(DisconnectReason::ConnectionLost));
        assert!(m.reconnect_pending());

        let actions = m.handle(MachineInput::Shutdown);
        let cancel = actions
            .iter()
            .position(|a| *a == Action::CancelReconnect)
            .expect("cancel emitted");
        let close = actions
            .iter()
            .position(|a| *a == Action::CloseSession { deliberate: true })
            .expect("close emitted");
        assert!(cancel < close);
        assert_eq!(m.reconnect_attempt(), 0);
        assert!(m.is_shutting_down());

        assert!(m.handle(MachineInput::Shutdown).is_empty());
        assert!(m.handle(MachineInput::ReconnectDue).is_empty());
        assert!(scheduled(&m.handle(closed(DisconnectReason::ConnectionLost))).is_empty());
    }

    #[test]
    fn credential_rotation_is_persisted_in_any_phase() {
        let set = CredentialSet::new().with_entry("creds.json", b"{}".to_vec());
        let mut m = machine();
        for input in [MachineInput::Start, MachineInput::Shutdown] {
            m.handle(input);
            assert_eq!(
                m.handle(session(SessionEvent::CredentialsUpdated(set.clone()))),
                vec![Action::PersistCredentials(set.clone())]
            );
        }
    }

    #[test]
    fn known_account_is_not_recorded_twice() {
        let mut m = machine().with_account(Some("15550001111".into()));
        m.handle(MachineInput::Start);
        let actions = m.handle(opened(Some("15550001111")));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::RecordAccount(_))));
        let report = m.report("sales", 7);
        assert_eq!(report.account_id.as_deref(), Some("15550001111"));
        assert!(report.is_open());
    }
}
