//! The privileged main instance.
//!
//! It is not part of the registry. Its liveness is the pid marker the worker
//! keeps at `data/main.pid`; the manager writes the marker as soon as it has
//! spawned the worker and removes stale ones whenever it finds them.

use std::{path::PathBuf, sync::Arc, time::Duration};

use fleet_sdk::MainStatus;
use fleet_session::{marker, CredentialStore, InfoSurface, PairingChannel, SessionPaths};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::SupervisorError,
    launcher::{LaunchSpec, WorkerLauncher},
    metrics,
    supervisor::absolute,
};

pub const MAIN_INSTANCE_NAME: &str = "main";

#[derive(Debug, Clone)]
pub struct MainInstanceConfig {
    pub workdir: PathBuf,
    pub env_path: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub qr_max_age: Duration,
}

pub struct MainInstance {
    config: MainInstanceConfig,
    paths: SessionPaths,
    launcher: Arc<dyn WorkerLauncher>,
    ops: Mutex<()>,
}

impl MainInstance {
    pub fn new(mut config: MainInstanceConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        config.workdir = absolute(config.workdir);
        config.pid_file = absolute(config.pid_file);
        config.env_path = config.env_path.map(absolute);
        let paths = SessionPaths::in_dir(&config.workdir);
        Self {
            config,
            paths,
            launcher,
            ops: Mutex::new(()),
        }
    }

    pub async fn status(&self) -> MainStatus {
        let _ops = self.ops.lock().await;
        self.status_locked()
    }

    /// Starting a running main instance reports its current status.
    pub async fn start(&self) -> Result<MainStatus, SupervisorError> {
        let _ops = self.ops.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<MainStatus, SupervisorError> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await?;
        Ok(self.status_locked())
    }

    /// Stops the worker, discards its credentials and starts it unpaired.
    pub async fn reset(&self) -> Result<MainStatus, SupervisorError> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await?;
        CredentialStore::new(&self.paths.credentials_dir).clear()?;
        PairingChannel::new(&self.paths.challenge_file).clear()?;
        InfoSurface::new(&self.paths.info_file).clear()?;
        metrics::INSTANCE_RESETS
            .with_label_values(&[MAIN_INSTANCE_NAME])
            .inc();
        self.start_locked().await
    }

    pub fn qr(&self) -> Result<Option<String>, SupervisorError> {
        Ok(PairingChannel::new(&self.paths.challenge_file).read_fresh(self.config.qr_max_age)?)
    }

    async fn start_locked(&self) -> Result<MainStatus, SupervisorError> {
        if self.live_pid().is_some() {
            return Ok(self.status_locked());
        }

        let spec = LaunchSpec {
            instance: MAIN_INSTANCE_NAME.to_string(),
            workdir: self.config.workdir.clone(),
            env_file: self.config.env_path.clone(),
            main: true,
            extra_env: vec![
                ("BACKEND_DISABLED".to_string(), "1".to_string()),
                (
                    "PID_FILE".to_string(),
                    self.config.pid_file.display().to_string(),
                ),
            ],
        };
        let pid = match self.launcher.spawn(&spec).await {
            Ok(pid) => pid,
            Err(err) => {
                metrics::WORKER_SPAWN_FAILURES
                    .with_label_values(&[MAIN_INSTANCE_NAME])
                    .inc();
                return Err(err);
            }
        };
        metrics::WORKER_SPAWNS
            .with_label_values(&[MAIN_INSTANCE_NAME])
            .inc();
        marker::write(&self.config.pid_file, pid)?;
        info!(pid, "main instance started");
        Ok(self.status_locked())
    }

    async fn stop_locked(&self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.live_pid() {
            self.launcher.terminate(pid).await?;
            metrics::WORKER_STOPS
                .with_label_values(&[MAIN_INSTANCE_NAME])
                .inc();
            info!(pid, "main instance stopped");
        }
        marker::remove(&self.config.pid_file)?;
        if let Err(err) = PairingChannel::new(&self.paths.challenge_file).clear() {
            warn!(error = %err, "failed to clear main pairing challenge");
        }
        Ok(())
    }

    fn live_pid(&self) -> Option<u32> {
        let pid = marker::read(&self.config.pid_file)?;
        if self.launcher.is_alive(pid) {
            return Some(pid);
        }
        warn!(pid, "removing stale main pid marker");
        if let Err(err) = marker::remove(&self.config.pid_file) {
            warn!(error = %err, "failed to remove stale main pid marker");
        }
        None
    }

    /// A live worker whose session went terminal reports as not running.
    fn status_locked(&self) -> MainStatus {
        let pid = self.live_pid();
        let report = match InfoSurface::new(&self.paths.info_file).read() {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable main worker report");
                None
            }
        };
        let current = report.as_ref().filter(|report| pid == Some(report.pid));
        MainStatus {
            running: pid.is_some() && !current.is_some_and(|report| report.terminal),
            pid,
            wa_number: report.as_ref().and_then(|report| report.account_id.clone()),
            phase: current.map(|report| report.phase.as_str().to_string()),
            last_error: current.and_then(|report| report.last_error.clone()),
        }
    }
}
