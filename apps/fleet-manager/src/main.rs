use std::net::SocketAddr;

use anyhow::Context;
use fleet_manager::{config::AppConfig, routes::build_router, state::AppState, telemetry};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env().context("invalid configuration")?;
    telemetry::init(cfg.log_path.as_deref())?;
    info!(build = fleet_manager::BUILD_ID, "starting fleet manager");

    let state = AppState::from_config(&cfg).await?;
    if let Err(err) = state.supervisor().reconcile_on_boot().await {
        warn!(error = %err, "failed to reconcile instances on boot");
    }

    let addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .with_context(|| format!("invalid BIND_ADDR {:?}", cfg.bind_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "fleet manager listening");

    axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("fleet manager stopped; workers keep running");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
