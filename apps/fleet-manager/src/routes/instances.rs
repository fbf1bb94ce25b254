use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use fleet_sdk::{
    BranchesResponse, CreateInstanceRequest, InstanceId, InstanceSummary, QrResponse,
    UpdateInstanceRequest,
};

use super::{ApiError, ApiResult, CurrentUser};
use crate::state::AppState;

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid instance id {raw:?}")))
}

pub async fn list(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Vec<InstanceSummary>> {
    Ok(Json(state.supervisor().list().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().get(parse_id(&id)?).await?))
}

pub async fn create(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(body): Json<CreateInstanceRequest>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().create(body).await?))
}

pub async fn update(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateInstanceRequest>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().update(parse_id(&id)?, body).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().start(parse_id(&id)?).await?))
}

pub async fn stop(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().stop(parse_id(&id)?).await?))
}

pub async fn reset(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<InstanceSummary> {
    Ok(Json(state.supervisor().reset(parse_id(&id)?).await?))
}

pub async fn qr(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<QrResponse> {
    let qr = state.supervisor().qr(parse_id(&id)?).await?;
    Ok(Json(QrResponse { qr }))
}

pub async fn branches(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<BranchesResponse> {
    let branches = state.supervisor().branches().await?;
    Ok(Json(BranchesResponse { branches }))
}
