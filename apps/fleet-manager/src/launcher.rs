//! Spawning and terminating worker processes.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    process::{Child, Command},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub instance: String,
    pub workdir: PathBuf,
    pub env_file: Option<PathBuf>,
    pub main: bool,
    pub extra_env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn instance(name: impl Into<String>, workdir: impl Into<PathBuf>, env_file: impl Into<PathBuf>) -> Self {
        Self {
            instance: name.into(),
            workdir: workdir.into(),
            env_file: Some(env_file.into()),
            main: false,
            extra_env: Vec::new(),
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Starts a worker and returns its pid.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError>;

    /// Asks the worker to shut down and waits for it to exit.
    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Launches the worker binary as a child process.
///
/// Children spawned by this launcher are kept so they can be reaped; pids
/// inherited from an earlier manager run are checked with `kill(pid, 0)`.
pub struct ProcessLauncher {
    command: String,
    grace: Duration,
    children: Arc<Mutex<HashMap<u32, Child>>>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, grace: Duration) -> Self {
        Self {
            command: command.into(),
            grace,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn wait_untracked(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                return true;
            }
            sleep(LIVENESS_POLL).await;
        }
        !pid_alive(pid)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        let mut command = Command::new(&self.command);
        command
            .arg("--instance")
            .arg(&spec.instance)
            .current_dir(&spec.workdir)
            .env("INSTANCE", &spec.instance)
            .env("INSTANCE_NAME", &spec.instance)
            .env("INSTANCE_PATH", &spec.workdir)
            .stdin(Stdio::null());
        if spec.main {
            command.arg("--main");
        }
        if let Some(env_file) = &spec.env_file {
            command.env("ENV_PATH", env_file);
        }
        for (key, value) in &spec.extra_env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|err| {
            SupervisorError::Spawn(format!("{} ({}): {err}", self.command, spec.workdir.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("worker exited before reporting a pid".into()))?;
        self.children.lock().insert(pid, child);
        info!(instance = %spec.instance, pid, main = spec.main, "worker spawned");
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        let tracked = self.children.lock().remove(&pid);
        if !send_signal(pid, libc::SIGTERM)? {
            debug!(pid, "worker already gone");
            if let Some(mut child) = tracked {
                let _ = child.wait().await;
            }
            return Ok(());
        }

        let exited = match tracked {
            Some(mut child) => match timeout(self.grace, child.wait()).await {
                Ok(status) => {
                    debug!(pid, ?status, "worker exited");
                    true
                }
                Err(_) => {
                    warn!(pid, "worker ignored SIGTERM; killing it");
                    child
                        .kill()
                        .await
                        .map_err(|err| SupervisorError::Stop {
                            pid,
                            reason: err.to_string(),
                        })?;
                    true
                }
            },
            None => self.wait_untracked(pid).await,
        };

        if !exited {
            warn!(pid, "worker ignored SIGTERM; killing it");
            send_signal(pid, libc::SIGKILL)?;
        }
        info!(pid, "worker stopped");
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(pid, %status, "worker has exited");
                    children.remove(&pid);
                    false
                }
                Err(err) => {
                    warn!(pid, error = %err, "failed to poll worker");
                    false
                }
            };
        }
        drop(children);
        pid_alive(pid)
    }
}

/// Probes a pid with signal 0.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns `Ok(false)` when the process no longer exists.
fn send_signal(pid: u32, signal: libc::c_int) -> Result<bool, SupervisorError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| SupervisorError::Stop {
        pid,
        reason: "pid out of range".into(),
    })?;
    // SAFETY: plain kill(2); the pid was recorded by this launcher.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(SupervisorError::Stop {
        pid,
        reason: err.to_string(),
    })
}
