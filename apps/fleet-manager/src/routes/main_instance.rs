use axum::{extract::State, Json};
use fleet_sdk::{MainStatus, QrResponse};
use tracing::info;

use super::{ApiResult, MainOperator};
use crate::state::AppState;

pub async fn status(State(state): State<AppState>, _op: MainOperator) -> ApiResult<MainStatus> {
    Ok(Json(state.main().status().await))
}

pub async fn start(State(state): State<AppState>, MainOperator(op): MainOperator) -> ApiResult<MainStatus> {
    info!(username = %op.username, "main instance start requested");
    Ok(Json(state.main().start().await?))
}

pub async fn stop(State(state): State<AppState>, MainOperator(op): MainOperator) -> ApiResult<MainStatus> {
    info!(username = %op.username, "main instance stop requested");
    Ok(Json(state.main().stop().await?))
}

pub async fn reset(State(state): State<AppState>, MainOperator(op): MainOperator) -> ApiResult<MainStatus> {
    info!(username = %op.username, "main instance reset requested");
    Ok(Json(state.main().reset().await?))
}

pub async fn qr(State(state): State<AppState>, _op: MainOperator) -> ApiResult<QrResponse> {
    Ok(Json(QrResponse {
        qr: state.main().qr()?,
    }))
}
