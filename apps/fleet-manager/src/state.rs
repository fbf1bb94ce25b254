use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    auth::{AuthConfig, AuthContext},
    config::AppConfig,
    launcher::{ProcessLauncher, WorkerLauncher},
    main_instance::{MainInstance, MainInstanceConfig},
    registry::InstanceRegistry,
    source::GitCli,
    supervisor::{Supervisor, SupervisorConfig},
};

#[derive(Clone)]
pub struct AppState {
    supervisor: Supervisor,
    main: Arc<MainInstance>,
    auth: AuthContext,
}

impl AppState {
    pub fn new(supervisor: Supervisor, main: MainInstance, auth: AuthContext) -> Self {
        Self {
            supervisor,
            main: Arc::new(main),
            auth,
        }
    }

    /// Wires the production launcher, git and the persisted registry.
    pub async fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let secret = match &cfg.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("JWT_SECRET not set; using a random secret, tokens will not survive a restart");
                AuthConfig::random_secret()
            }
        };
        let auth = AuthContext::new(AuthConfig {
            secret,
            token_ttl: cfg.token_ttl(),
            main_operators: cfg.main_operators(),
        });
        if let (Some(username), Some(password)) = (&cfg.admin_username, &cfg.admin_password) {
            auth.register(username, password)
                .await
                .context("failed to register the bootstrap admin")?;
            info!(username = %username, "bootstrap admin registered");
        }

        let registry = InstanceRegistry::load(cfg.registry_file())
            .with_context(|| format!("failed to load {}", cfg.registry_file().display()))?;
        let launcher: Arc<dyn WorkerLauncher> =
            Arc::new(ProcessLauncher::new(&cfg.worker_command, cfg.stop_grace()));
        let supervisor = Supervisor::new(
            SupervisorConfig {
                instances_dir: cfg.instances_dir.clone(),
                default_repo_url: cfg.default_repo_url.clone(),
                qr_max_age: cfg.qr_max_age(),
            },
            registry,
            launcher.clone(),
            Arc::new(GitCli::default()),
        );
        let main = MainInstance::new(
            MainInstanceConfig {
                workdir: cfg.main_workdir.clone(),
                env_path: Some(cfg.main_env_path.clone()),
                pid_file: cfg.main_pid_file(),
                qr_max_age: cfg.qr_max_age(),
            },
            launcher,
        );
        Ok(Self::new(supervisor, main, auth))
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn main(&self) -> &MainInstance {
        &self.main
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }
}
