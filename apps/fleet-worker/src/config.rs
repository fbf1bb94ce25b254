use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fleet_session::{ReconnectPolicy, SessionPaths};

pub const UNNAMED_INSTANCE: &str = "Not Found";

#[derive(Debug, Parser)]
#[command(
    name = "fleet-worker",
    author,
    version,
    about = "Hosts the chat session of a single fleet instance"
)]
pub struct Cli {
    /// Instance name reported in logs and in the worker report.
    #[arg(long, env = "INSTANCE")]
    instance: Option<String>,

    #[arg(long, env = "INSTANCE_NAME", hide = true)]
    instance_name: Option<String>,

    /// Run as the privileged instance.
    #[arg(long, default_value_t = false)]
    main: bool,

    /// Directory holding the instance's files. Defaults to the working directory.
    #[arg(long, env = "INSTANCE_PATH")]
    instance_path: Option<PathBuf>,

    /// Where the current pairing challenge is published.
    #[arg(long, env = "QR_PATH")]
    qr_path: Option<PathBuf>,

    /// Credential directory for this instance.
    #[arg(long, env = "AUTH_DIR")]
    auth_dir: Option<PathBuf>,

    /// Worker report location.
    #[arg(long, env = "INFO_PATH")]
    info_path: Option<PathBuf>,

    /// PID marker written by the privileged instance.
    #[arg(long, env = "PID_FILE", default_value = "data/main.pid")]
    pid_file: PathBuf,

    /// Backend started alongside the privileged instance.
    #[arg(long, env = "BACKEND_COMMAND")]
    backend_command: Option<String>,

    #[arg(
        long,
        env = "BACKEND_DISABLED",
        default_value_t = false,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    backend_disabled: bool,

    /// Protocol bridge spawned for every connection attempt.
    #[arg(long, env = "BRIDGE_COMMAND")]
    bridge_command: Option<String>,

    /// Give up after this many consecutive reconnects. Unbounded when unset or 0.
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub instance: String,
    pub main: bool,
    pub instance_path: PathBuf,
    pub paths: SessionPaths,
    pub pid_file: PathBuf,
    pub backend_command: Option<String>,
    pub bridge_command: String,
    pub policy: ReconnectPolicy,
}

impl TryFrom<Cli> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let instance = cli
            .instance
            .or(cli.instance_name)
            .and_then(normalize)
            .unwrap_or_else(|| UNNAMED_INSTANCE.to_string());

        let instance_path = match cli.instance_path {
            Some(path) => path,
            None => std::env::current_dir().context("failed to resolve working directory")?,
        };

        let mut paths = SessionPaths::in_dir(&instance_path);
        if let Some(qr) = cli.qr_path {
            paths.challenge_file = qr;
        }
        if let Some(dir) = cli.auth_dir {
            paths.credentials_dir = dir;
        }
        if let Some(info) = cli.info_path {
            paths.info_file = info;
        }

        let Some(bridge_command) = cli.bridge_command.and_then(normalize) else {
            bail!("BRIDGE_COMMAND must be set");
        };

        // Only the privileged instance hosts the backend.
        let backend_command = if cli.main && !cli.backend_disabled {
            cli.backend_command.and_then(normalize)
        } else {
            None
        };

        let policy = ReconnectPolicy::default().with_max_attempts(cli.max_reconnect_attempts);

        Ok(WorkerConfig {
            instance,
            main: cli.main,
            instance_path,
            paths,
            pid_file: cli.pid_file,
            backend_command,
            bridge_command,
            policy,
        })
    }
}

fn normalize(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
