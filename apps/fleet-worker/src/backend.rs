//! Supervised backend process hosted by the privileged worker.

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    process::{Child, Command},
    sync::watch,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STOP_GRACE: Duration = Duration::from_secs(10);

/// How the backend ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendExit {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// True when the exit followed a stop request.
    pub requested: bool,
}

#[derive(Debug, Clone)]
pub struct BackendHandle {
    pid: Option<u32>,
    stop: CancellationToken,
    exited: watch::Receiver<Option<BackendExit>>,
}

impl BackendHandle {
    /// Spawns `command` through the shell with inherited stdio.
    pub fn spawn(command: &str, workdir: &Path) -> Result<Self> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn backend `{command}`"))?;
        let pid = child.id();
        info!(pid, command, "backend started");

        let stop = CancellationToken::new();
        let (tx, exited) = watch::channel(None);
        tokio::spawn(supervise(child, stop.clone(), tx));
        Ok(Self { pid, stop, exited })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once the backend has exited for any reason.
    pub async fn exited(&self) -> BackendExit {
        let mut rx = self.exited.clone();
        let result = rx.wait_for(Option::is_some).await.map(|exit| *exit);
        match result {
            Ok(Some(exit)) => exit,
            // The supervisor only goes away after publishing an exit.
            _ => BackendExit {
                code: None,
                requested: self.stop.is_cancelled(),
            },
        }
    }

    /// Sends SIGTERM and waits for the backend to exit, killing it once the
    /// stop grace runs out.
    pub async fn stop(&self) -> BackendExit {
        self.stop.cancel();
        self.exited().await
    }
}

async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    tx: watch::Sender<Option<BackendExit>>,
) {
    let exit = tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(error = %err, "failed to wait for backend");
                    None
                }
            };
            BackendExit { code, requested: false }
        }
        _ = stop.cancelled() => {
            if let Some(pid) = child.id() {
                terminate(pid);
            }
            let code = match timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(err)) => {
                    warn!(error = %err, "failed to wait for backend");
                    None
                }
                Err(_) => {
                    warn!("backend ignored SIGTERM; killing it");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill backend");
                    }
                    None
                }
            };
            BackendExit { code, requested: true }
        }
    };
    info!(code = exit.code, requested = exit.requested, "backend exited");
    let _ = tx.send(Some(exit));
}

fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a pid we spawned and still own.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "failed to signal backend"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_exit_code_of_a_backend_that_dies() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = BackendHandle::spawn("exit 3", tmp.path()).unwrap();
        let exit = backend.exited().await;
        assert_eq!(
            exit,
            BackendExit {
                code: Some(3),
                requested: false
            }
        );
    }

    #[tokio::test]
    async fn stop_terminates_and_is_repeatable() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = BackendHandle::spawn("exec sleep 30", tmp.path()).unwrap();
        assert!(backend.pid().is_some());

        let exit = backend.stop().await;
        assert!(exit.requested);
        assert_eq!(exit.code, None);

        assert_eq!(backend.stop().await, exit);
        assert_eq!(backend.exited().await, exit);
    }

    #[tokio::test]
    async fn backend_ignoring_sigterm_is_killed_after_the_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = BackendHandle::spawn("trap '' TERM; exec sleep 60", tmp.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        let exit = backend.stop().await;
        assert!(started.elapsed() >= STOP_GRACE);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(
            exit,
            BackendExit {
                code: None,
                requested: true
            }
        );
    }

    #[tokio::test]
    async fn spawn_in_missing_directory_fails() {
        let result = BackendHandle::spawn("true", Path::new("/nonexistent/fleet/main"));
        assert!(result.is_err());
    }
}
