use std::{path::PathBuf, time::Duration};

use config::{builder::DefaultState, ConfigBuilder, ConfigError};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,
    /// Repository cloned for instances created without an explicit `repo_url`.
    #[serde(default)]
    pub default_repo_url: Option<String>,
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default = "default_main_workdir")]
    pub main_workdir: PathBuf,
    #[serde(default = "default_main_env_path")]
    pub main_env_path: PathBuf,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Comma separated usernames allowed to control the main instance.
    #[serde(default)]
    pub main_operators: Option<String>,
    #[serde(default)]
    pub admin_username: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default = "default_qr_max_age_secs")]
    pub qr_max_age_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builder(
            config::Config::builder().add_source(config::Environment::default().separator("__")),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.default_repo_url = Self::normalize_opt(self.default_repo_url.take());
        self.jwt_secret = Self::normalize_opt(self.jwt_secret.take());
        self.main_operators = Self::normalize_opt(self.main_operators.take());
        self.admin_username = Self::normalize_opt(self.admin_username.take());
        self.admin_password = Self::normalize_opt(self.admin_password.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn main_operators(&self) -> Vec<String> {
        self.main_operators
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn main_pid_file(&self) -> PathBuf {
        self.data_dir.join("main.pid")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("instances.json")
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn qr_max_age(&self) -> Duration {
        Duration::from_secs(self.qr_max_age_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_instances_dir() -> PathBuf {
    PathBuf::from("./instances")
}

fn default_worker_command() -> String {
    "fleet-worker".to_string()
}

fn default_main_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_main_env_path() -> PathBuf {
    PathBuf::from(".env")
}

fn default_token_ttl_secs() -> u64 {
    86_400
}

fn default_qr_max_age_secs() -> u64 {
    30
}

fn default_stop_grace_secs() -> u64 {
    10
}
