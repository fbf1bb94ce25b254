mod backend;
mod bridge;
mod config;
mod shutdown;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use backend::{BackendExit, BackendHandle};
use bridge::BridgeConnector;
use clap::Parser;
use config::{Cli, WorkerConfig};
use fleet_session::{marker::PidMarker, SessionDriver};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let env_file = load_env_file();
    init_tracing();
    match env_file {
        Ok(Some(path)) => info!(path = %path.display(), "loaded instance environment"),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "failed to load environment file"),
    }

    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config = WorkerConfig::try_from(Cli::parse())?;
    info!(
        instance = %config.instance,
        main = config.main,
        path = %config.instance_path.display(),
        pid = std::process::id(),
        "worker starting"
    );

    let marker = if config.main {
        Some(PidMarker::acquire(&config.pid_file).context("failed to write pid marker")?)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signals = shutdown::listen(shutdown.clone()).context("failed to install signal handlers")?;

    let backend = match config.backend_command.as_deref() {
        Some(command) => Some(BackendHandle::spawn(command, &config.instance_path)?),
        None => None,
    };
    let backend_watch = backend
        .clone()
        .map(|backend| tokio::spawn(watch_backend(backend, shutdown.clone())));

    let connector = BridgeConnector::new(config.bridge_command.clone(), &config.instance_path);
    let mut driver = SessionDriver::new(
        config.instance.clone(),
        config.paths.clone(),
        config.policy,
        connector,
    );
    if let Some(backend) = backend.clone() {
        driver = driver.before_close(async move {
            backend.stop().await;
        });
    }

    let outcome = driver.run(shutdown.clone()).await;

    // Reached on every path out of the session, including a failed first connect.
    shutdown.cancel();
    signals.abort();
    if let Some(backend) = &backend {
        backend.stop().await;
    }
    if let Some(marker) = &marker {
        marker.release();
    }

    let phase = outcome.context("session could not be constructed")?;
    info!(instance = %config.instance, ?phase, "worker stopped");

    let backend_exit = match backend_watch {
        Some(handle) => handle.await.ok().flatten(),
        None => None,
    };
    Ok(ExitCode::from(exit_status(backend_exit)))
}

/// Starts ordered shutdown when the backend dies on its own.
async fn watch_backend(backend: BackendHandle, shutdown: CancellationToken) -> Option<BackendExit> {
    tokio::select! {
        exit = backend.exited() => {
            if exit.requested {
                return None;
            }
            warn!(code = exit.code, "backend exited unexpectedly; shutting down");
            shutdown.cancel();
            Some(exit)
        }
        _ = shutdown.cancelled() => None,
    }
}

/// Non-zero backend exit codes become the worker's own.
fn exit_status(backend_exit: Option<BackendExit>) -> u8 {
    match backend_exit.and_then(|exit| exit.code).filter(|code| *code != 0) {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 0,
    }
}

fn load_env_file() -> Result<Option<PathBuf>, dotenvy::Error> {
    match std::env::var_os("ENV_PATH") {
        Some(path) => {
            let path = PathBuf::from(path);
            dotenvy::from_path(&path)?;
            Ok(Some(path))
        }
        None => Ok(dotenvy::dotenv().ok()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
