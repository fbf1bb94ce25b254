//! Durable registry of declared instances.
//!
//! The whole registry is one JSON document rewritten after every mutation.
//! Only the supervisor mutates it, and always under its operation lock.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fleet_sdk::{InstanceId, InstanceStatus, InstanceSummary};
use fleet_session::WorkerReport;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SupervisorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub status: InstanceStatus,
    pub path: PathBuf,
    pub env_path: PathBuf,
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Merges the record with the worker's last report. A report from the
    /// current worker that went terminal reads as stopped; the pid is kept so
    /// the worker can still be stopped.
    pub fn summary(&self, report: Option<&WorkerReport>) -> InstanceSummary {
        let current = report.filter(|report| self.is_running() && self.pid == Some(report.pid));
        let status = match current {
            Some(report) if report.terminal => InstanceStatus::Stopped,
            _ => self.status,
        };
        InstanceSummary {
            id: self.id,
            name: self.name.clone(),
            repo_url: self.repo_url.clone(),
            version: self.version.clone(),
            port: self.port,
            status,
            path: self.path.display().to_string(),
            env_path: self.env_path.display().to_string(),
            pid: self.pid,
            wa_number: report.and_then(|report| report.account_id.clone()),
            phase: current.map(|report| report.phase.as_str().to_string()),
            last_error: current.and_then(|report| report.last_error.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_started_at: self.last_started_at,
        }
    }
}

/// Fields supplied when declaring a new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub repo_url: String,
    pub version: Option<String>,
    pub port: Option<u16>,
    pub path: PathBuf,
    pub env_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    next_id: InstanceId,
    instances: Vec<InstanceRecord>,
}

pub struct InstanceRegistry {
    path: PathBuf,
    doc: RwLock<RegistryDocument>,
}

impl InstanceRegistry {
    /// Loads the registry at `path`; a missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SupervisorError> {
        let path = path.into();
        let doc = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => RegistryDocument::default(),
            Err(err) => return Err(SupervisorError::io(&path, err)),
        };
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<InstanceRecord> {
        self.doc.read().await.instances.clone()
    }

    pub async fn get(&self, id: InstanceId) -> Option<InstanceRecord> {
        self.doc
            .read()
            .await
            .instances
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<InstanceRecord> {
        self.doc
            .read()
            .await
            .instances
            .iter()
            .find(|record| record.name == name)
            .cloned()
    }

    pub async fn insert(&self, new: NewInstance) -> Result<InstanceRecord, SupervisorError> {
        let mut doc = self.doc.write().await;
        if doc.instances.iter().any(|record| record.name == new.name) {
            return Err(SupervisorError::AlreadyExists(new.name));
        }
        doc.next_id = doc.next_id.max(1);
        let now = Utc::now();
        let record = InstanceRecord {
            id: doc.next_id,
            name: new.name,
            repo_url: new.repo_url,
            version: new.version,
            port: new.port,
            status: InstanceStatus::Stopped,
            path: new.path,
            env_path: new.env_path,
            pid: None,
            created_at: now,
            updated_at: now,
            last_started_at: None,
        };
        doc.next_id += 1;
        doc.instances.push(record.clone());
        self.persist(&doc)?;
        Ok(record)
    }

    /// Applies `mutate` to the record and stamps `updated_at`.
    pub async fn update<F>(&self, id: InstanceId, mutate: F) -> Result<InstanceRecord, SupervisorError>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut doc = self.doc.write().await;
        let record = doc
            .instances
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(SupervisorError::NotFound(id))?;
        mutate(record);
        record.updated_at = Utc::now();
        let updated = record.clone();
        self.persist(&doc)?;
        Ok(updated)
    }

    pub async fn remove(&self, id: InstanceId) -> Result<InstanceRecord, SupervisorError> {
        let mut doc = self.doc.write().await;
        let index = doc
            .instances
            .iter()
            .position(|record| record.id == id)
            .ok_or(SupervisorError::NotFound(id))?;
        let removed = doc.instances.remove(index);
        self.persist(&doc)?;
        Ok(removed)
    }

    fn persist(&self, doc: &RegistryDocument) -> Result<(), SupervisorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| SupervisorError::io(parent, err))?;
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|err| SupervisorError::io(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| SupervisorError::io(&self.path, err))?;
        debug!(path = %self.path.display(), instances = doc.instances.len(), "registry saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance(name: &str, root: &Path) -> NewInstance {
        NewInstance {
            name: name.into(),
            repo_url: "https://example.com/bot.git".into(),
            version: Some("main".into()),
            port: Some(3001),
            path: root.join(name),
            env_path: root.join(name).join(".env"),
        }
    }

    #[tokio::test]
    async fn records_survive_a_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data/instances.json");
        let registry = InstanceRegistry::load(&path).unwrap();
        let first = registry.insert(new_instance("sales", tmp.path())).await.unwrap();
        let second = registry.insert(new_instance("support", tmp.path())).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        registry
            .update(first.id, |record| {
                record.status = InstanceStatus::Running;
                record.pid = Some(4242);
            })
            .await
            .unwrap();

        let reloaded = InstanceRegistry::load(&path).unwrap();
        let records = reloaded.list().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pid, Some(4242));
        assert!(records[0].is_running());

        let third = reloaded.insert(new_instance("ops", tmp.path())).await.unwrap();
        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn names_are_unique_and_ids_are_not_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::load(tmp.path().join("instances.json")).unwrap();
        let first = registry.insert(new_instance("sales", tmp.path())).await.unwrap();
        assert!(matches!(
            registry.insert(new_instance("sales", tmp.path())).await,
            Err(SupervisorError::AlreadyExists(name)) if name == "sales"
        ));

        registry.remove(first.id).await.unwrap();
        assert!(registry.get(first.id).await.is_none());
        let again = registry.insert(new_instance("sales", tmp.path())).await.unwrap();
        assert_eq!(again.id, 2);
        assert_eq!(registry.find_by_name("sales").await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::load(tmp.path().join("instances.json")).unwrap();
        assert!(matches!(
            registry.update(9, |_| {}).await,
            Err(SupervisorError::NotFound(9))
        ));
        assert!(matches!(
            registry.remove(9).await,
            Err(SupervisorError::NotFound(9))
        ));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("instances.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            InstanceRegistry::load(&path),
            Err(SupervisorError::Registry(_))
        ));
    }
}
