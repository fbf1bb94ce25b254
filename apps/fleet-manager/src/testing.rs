//! In-process stand-ins for worker processes and git.

use std::{
    collections::HashSet,
    path::Path,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::SupervisorError,
    launcher::{LaunchSpec, WorkerLauncher},
    source::SourceControl,
};

pub(crate) struct FakeLauncher {
    next_pid: AtomicU32,
    fail_spawns: AtomicBool,
    alive: Mutex<HashSet<u32>>,
    spawned: Mutex<Vec<LaunchSpec>>,
    terminated: Mutex<Vec<u32>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(10_000),
            fail_spawns: AtomicBool::new(false),
            alive: Mutex::new(HashSet::new()),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    /// Simulates a worker exiting on its own.
    pub(crate) fn crash(&self, pid: u32) {
        self.alive.lock().remove(&pid);
    }

    pub(crate) fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn spawned(&self) -> Vec<LaunchSpec> {
        self.spawned.lock().clone()
    }

    pub(crate) fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(SupervisorError::Spawn("worker binary missing".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().insert(pid);
        self.spawned.lock().push(spec.clone());
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        self.alive.lock().remove(&pid);
        self.terminated.lock().push(pid);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

/// Creates the destination directory instead of cloning.
#[derive(Default)]
pub(crate) struct FakeSource {
    fail_next: AtomicBool,
    checkouts: Mutex<Vec<(String, Option<String>)>>,
    switches: Mutex<Vec<String>>,
}

impl FakeSource {
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn checkouts(&self) -> Vec<(String, Option<String>)> {
        self.checkouts.lock().clone()
    }

    pub(crate) fn switches(&self) -> Vec<String> {
        self.switches.lock().clone()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn checkout(
        &self,
        repo_url: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(dest).map_err(|err| SupervisorError::io(dest, err))?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SupervisorError::SourceControl(format!(
                "git clone failed: repository {repo_url} not found"
            )));
        }
        self.checkouts
            .lock()
            .push((repo_url.to_string(), version.map(str::to_string)));
        Ok(())
    }

    async fn switch_version(&self, _dest: &Path, version: &str) -> Result<(), SupervisorError> {
        self.switches.lock().push(version.to_string());
        Ok(())
    }

    async fn remote_branches(&self, _repo_url: &str) -> Result<Vec<String>, SupervisorError> {
        Ok(vec!["main".to_string(), "next".to_string()])
    }
}
