//! Checkout of instance source trees.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::SupervisorError;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clones `repo_url` into `dest`, which must not exist yet, and checks out
    /// `version` when given.
    async fn checkout(
        &self,
        repo_url: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<(), SupervisorError>;

    /// Moves an existing checkout to `version`.
    async fn switch_version(&self, dest: &Path, version: &str) -> Result<(), SupervisorError>;

    async fn remote_branches(&self, repo_url: &str) -> Result<Vec<String>, SupervisorError>;
}

/// [`SourceControl`] backed by the `git` command line.
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, SupervisorError> {
        let mut command = Command::new(&self.program);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await.map_err(|err| {
            SupervisorError::SourceControl(format!("failed to run {}: {err}", self.program))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::SourceControl(format!(
                "{} {} failed: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn checkout(
        &self,
        repo_url: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<(), SupervisorError> {
        if dest.exists() {
            return Err(SupervisorError::SourceControl(format!(
                "destination already exists: {}",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| SupervisorError::io(parent, err))?;
        }
        let dest_str = dest.to_string_lossy();
        self.run(&["clone", repo_url, &dest_str], None).await?;
        if let Some(version) = version {
            self.run(&["checkout", version], Some(dest)).await?;
        }
        info!(repo_url, version, dest = %dest.display(), "checked out instance source");
        Ok(())
    }

    async fn switch_version(&self, dest: &Path, version: &str) -> Result<(), SupervisorError> {
        self.run(&["fetch", "--all", "--tags"], Some(dest)).await?;
        self.run(&["checkout", version], Some(dest)).await?;
        info!(version, dest = %dest.display(), "switched instance version");
        Ok(())
    }

    async fn remote_branches(&self, repo_url: &str) -> Result<Vec<String>, SupervisorError> {
        let output = self.run(&["ls-remote", "--heads", repo_url], None).await?;
        Ok(parse_heads(&output))
    }
}

fn parse_heads(output: &str) -> Vec<String> {
    let mut branches: Vec<String> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|reference| reference.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect();
    branches.sort();
    branches
}
