//! Instance lifecycle: create, start, stop, update, reset, delete.
//!
//! Every mutating operation runs under one operation lock, so two requests
//! can never race to spawn a worker for the same instance. Reads reconcile
//! `running` records against pid liveness without taking the lock; the
//! registry update they issue only applies if the record still names the pid
//! that was found dead.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use fleet_sdk::{
    CreateInstanceRequest, InstanceId, InstanceStatus, InstanceSummary, UpdateInstanceRequest,
};
use fleet_session::{CredentialStore, InfoSurface, PairingChannel, SessionPaths};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::SupervisorError,
    launcher::{LaunchSpec, WorkerLauncher},
    metrics,
    registry::{InstanceRecord, InstanceRegistry, NewInstance},
    source::SourceControl,
};

const MANAGED_ENV_KEYS: [&str; 3] = ["INSTANCE_NAME", "INSTANCE_VERSION", "PORT"];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub instances_dir: PathBuf,
    pub default_repo_url: Option<String>,
    pub qr_max_age: Duration,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    registry: InstanceRegistry,
    launcher: Arc<dyn WorkerLauncher>,
    source: Arc<dyn SourceControl>,
    ops: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        mut config: SupervisorConfig,
        registry: InstanceRegistry,
        launcher: Arc<dyn WorkerLauncher>,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        config.instances_dir = absolute(config.instances_dir);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                launcher,
                source,
                ops: Mutex::new(()),
            }),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>, SupervisorError> {
        let mut summaries = Vec::new();
        for record in self.inner.registry.list().await {
            let record = self.reconcile(record).await?;
            summaries.push(summarize(&record));
        }
        self.refresh_running_gauge().await;
        Ok(summaries)
    }

    pub async fn get(&self, id: InstanceId) -> Result<InstanceSummary, SupervisorError> {
        let record = self.record(id).await?;
        let record = self.reconcile(record).await?;
        Ok(summarize(&record))
    }

    /// Declares a new instance and materializes its source tree. The instance
    /// is recorded as stopped; nothing is spawned.
    pub async fn create(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<InstanceSummary, SupervisorError> {
        let name = req.name.trim().to_string();
        validate_name(&name)?;
        let repo_url = req
            .repo_url
            .and_then(non_empty)
            .or_else(|| self.inner.config.default_repo_url.clone())
            .ok_or(SupervisorError::MissingRepository)?;
        let version = req.version.and_then(non_empty);

        let _ops = self.inner.ops.lock().await;
        if self.inner.registry.find_by_name(&name).await.is_some() {
            return Err(SupervisorError::AlreadyExists(name));
        }
        let path = self.inner.config.instances_dir.join(&name);
        if path.exists() {
            return Err(SupervisorError::AlreadyExists(name));
        }
        let env_path = path.join(".env");

        let prepared = async {
            self.inner
                .source
                .checkout(&repo_url, version.as_deref(), &path)
                .await?;
            write_env_file(&env_path, &name, version.as_deref(), req.port)
        };
        if let Err(err) = prepared.await {
            warn!(instance = %name, error = %err, "failed to prepare instance");
            remove_tree(&path);
            return Err(err);
        }

        let record = self
            .inner
            .registry
            .insert(NewInstance {
                name,
                repo_url,
                version,
                port: req.port,
                path,
                env_path,
            })
            .await?;
        info!(instance = %record.name, id = record.id, "instance created");
        Ok(summarize(&record))
    }

    pub async fn start(&self, id: InstanceId) -> Result<InstanceSummary, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let record = self.record(id).await?;
        let record = self.start_locked(record).await?;
        self.refresh_running_gauge().await;
        Ok(summarize(&record))
    }

    /// Stopping a stopped instance returns the record unchanged.
    pub async fn stop(&self, id: InstanceId) -> Result<InstanceSummary, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let record = self.record(id).await?;
        let record = self.stop_locked(record).await?;
        self.refresh_running_gauge().await;
        Ok(summarize(&record))
    }

    /// Applies a new version and/or port. A running instance is stopped,
    /// updated and started again.
    pub async fn update(
        &self,
        id: InstanceId,
        req: UpdateInstanceRequest,
    ) -> Result<InstanceSummary, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let record = self.record(id).await?;
        let version = req.version.and_then(non_empty);
        let version_changed = version.is_some() && version != record.version;
        let port_changed = req.port.is_some() && req.port != record.port;
        if !version_changed && !port_changed {
            return Ok(summarize(&record));
        }

        let record = self.reconcile(record).await?;
        let was_running = record.is_running();
        let record = if was_running {
            self.stop_locked(record).await?
        } else {
            record
        };

        if let (true, Some(version)) = (version_changed, version.as_deref()) {
            if let Err(err) = self.inner.source.switch_version(&record.path, version).await {
                if was_running {
                    if let Err(restart_err) = self.start_locked(record).await {
                        warn!(error = %restart_err, "failed to restart instance after failed update");
                    }
                }
                self.refresh_running_gauge().await;
                return Err(err);
            }
        }

        let record = self
            .inner
            .registry
            .update(id, |record| {
                if version_changed {
                    record.version = version.clone();
                }
                if port_changed {
                    record.port = req.port;
                }
            })
            .await?;
        write_env_file(
            &record.env_path,
            &record.name,
            record.version.as_deref(),
            record.port,
        )?;
        info!(instance = %record.name, version = ?record.version, port = ?record.port, "instance updated");

        let record = if was_running {
            self.start_locked(record).await?
        } else {
            record
        };
        self.refresh_running_gauge().await;
        Ok(summarize(&record))
    }

    /// Discards the instance's credentials and pairing challenge, then starts
    /// it so that it pairs from scratch.
    pub async fn reset(&self, id: InstanceId) -> Result<InstanceSummary, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let record = self.record(id).await?;
        let record = self.stop_locked(record).await?;

        let paths = SessionPaths::in_dir(&record.path);
        CredentialStore::new(paths.credentials_dir).clear()?;
        PairingChannel::new(paths.challenge_file).clear()?;
        InfoSurface::new(paths.info_file).clear()?;
        metrics::INSTANCE_RESETS
            .with_label_values(&[record.name.as_str()])
            .inc();
        info!(instance = %record.name, "credentials cleared");

        let record = self.start_locked(record).await?;
        self.refresh_running_gauge().await;
        Ok(summarize(&record))
    }

    /// Stops the worker if needed and removes the instance with its files.
    pub async fn delete(&self, id: InstanceId) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let record = self.record(id).await?;
        let record = self.stop_locked(record).await?;

        if record.path.starts_with(&self.inner.config.instances_dir) {
            match std::fs::remove_dir_all(&record.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(SupervisorError::io(&record.path, err)),
            }
        } else {
            warn!(path = %record.path.display(), "instance path is outside the instances dir; leaving it in place");
        }

        self.inner.registry.remove(id).await?;
        self.refresh_running_gauge().await;
        info!(instance = %record.name, id, "instance deleted");
        Ok(())
    }

    /// The instance's pairing challenge, if one was published recently enough.
    pub async fn qr(&self, id: InstanceId) -> Result<Option<String>, SupervisorError> {
        let record = self.record(id).await?;
        let paths = SessionPaths::in_dir(&record.path);
        Ok(PairingChannel::new(paths.challenge_file).read_fresh(self.inner.config.qr_max_age)?)
    }

    pub async fn branches(&self) -> Result<Vec<String>, SupervisorError> {
        let repo_url = self
            .inner
            .config
            .default_repo_url
            .as_deref()
            .ok_or(SupervisorError::MissingRepository)?;
        self.inner.source.remote_branches(repo_url).await
    }

    /// Brings instances persisted as running back up after a manager restart.
    /// Workers that outlived the previous manager are adopted as they are.
    pub async fn reconcile_on_boot(&self) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        for record in self.inner.registry.list().await {
            if !record.is_running() {
                continue;
            }
            if let Some(pid) = record.pid.filter(|pid| self.inner.launcher.is_alive(*pid)) {
                info!(instance = %record.name, pid, "adopting running worker");
                continue;
            }
            let record = self
                .inner
                .registry
                .update(record.id, |record| {
                    record.status = InstanceStatus::Stopped;
                    record.pid = None;
                })
                .await?;
            if let Err(err) = self.start_locked(record).await {
                warn!(error = %err, "failed to restart instance on boot");
            }
        }
        self.refresh_running_gauge().await;
        Ok(())
    }

    async fn record(&self, id: InstanceId) -> Result<InstanceRecord, SupervisorError> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or(SupervisorError::NotFound(id))
    }

    async fn reconcile(&self, record: InstanceRecord) -> Result<InstanceRecord, SupervisorError> {
        if !record.is_running() {
            return Ok(record);
        }
        let seen = record.pid;
        if seen.is_some_and(|pid| self.inner.launcher.is_alive(pid)) {
            return Ok(record);
        }
        info!(instance = %record.name, pid = ?seen, "worker is gone; marking instance stopped");
        self.inner
            .registry
            .update(record.id, |record| {
                if record.is_running() && record.pid == seen {
                    record.status = InstanceStatus::Stopped;
                    record.pid = None;
                }
            })
            .await
    }

    async fn start_locked(&self, record: InstanceRecord) -> Result<InstanceRecord, SupervisorError> {
        let record = self.reconcile(record).await?;
        if record.is_running() {
            return Err(SupervisorError::AlreadyRunning(record.name));
        }

        let spec = LaunchSpec::instance(&record.name, &record.path, &record.env_path);
        let pid = match self.inner.launcher.spawn(&spec).await {
            Ok(pid) => pid,
            Err(err) => {
                metrics::WORKER_SPAWN_FAILURES
                    .with_label_values(&[record.name.as_str()])
                    .inc();
                warn!(instance = %record.name, error = %err, "worker failed to start");
                return Err(err);
            }
        };
        metrics::WORKER_SPAWNS
            .with_label_values(&[record.name.as_str()])
            .inc();

        self.inner
            .registry
            .update(record.id, |record| {
                record.status = InstanceStatus::Running;
                record.pid = Some(pid);
                record.last_started_at = Some(Utc::now());
            })
            .await
    }

    async fn stop_locked(&self, record: InstanceRecord) -> Result<InstanceRecord, SupervisorError> {
        let record = self.reconcile(record).await?;
        if !record.is_running() {
            return Ok(record);
        }
        if let Some(pid) = record.pid {
            self.inner.launcher.terminate(pid).await?;
            metrics::WORKER_STOPS
                .with_label_values(&[record.name.as_str()])
                .inc();
        }

        let paths = SessionPaths::in_dir(&record.path);
        if let Err(err) = PairingChannel::new(paths.challenge_file).clear() {
            warn!(instance = %record.name, error = %err, "failed to clear pairing challenge");
        }

        self.inner
            .registry
            .update(record.id, |record| {
                record.status = InstanceStatus::Stopped;
                record.pid = None;
            })
            .await
    }

    async fn refresh_running_gauge(&self) {
        let running = self
            .inner
            .registry
            .list()
            .await
            .iter()
            .filter(|record| record.is_running())
            .count();
        metrics::RUNNING_INSTANCES.set(i64::try_from(running).unwrap_or(i64::MAX));
    }
}

fn summarize(record: &InstanceRecord) -> InstanceSummary {
    let info = InfoSurface::new(SessionPaths::in_dir(&record.path).info_file);
    let report = match info.read() {
        Ok(report) => report,
        Err(err) => {
            warn!(instance = %record.name, error = %err, "ignoring unreadable worker report");
            None
        }
    };
    record.summary(report.as_ref())
}

fn validate_name(name: &str) -> Result<(), SupervisorError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::InvalidName(name.to_string()))
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Rewrites the keys the supervisor owns and keeps every other line.
fn write_env_file(
    path: &Path,
    name: &str,
    version: Option<&str>,
    port: Option<u16>,
) -> Result<(), SupervisorError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(SupervisorError::io(path, err)),
    };

    let mut lines = vec![
        format!("INSTANCE_NAME={name}"),
        format!("INSTANCE_VERSION={}", version.unwrap_or_default()),
    ];
    if let Some(port) = port {
        lines.push(format!("PORT={port}"));
    }
    lines.extend(
        existing
            .lines()
            .filter(|line| {
                let key = line.split('=').next().unwrap_or_default().trim();
                !MANAGED_ENV_KEYS.contains(&key)
            })
            .map(str::to_string),
    );

    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(path, contents).map_err(|err| SupervisorError::io(path, err))
}

fn remove_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to clean up instance directory"),
    }
}

pub(crate) fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}
