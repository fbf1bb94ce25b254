use axum::{
    async_trait,
    extract::{Form, FromRequestParts, State},
    http::{request::Parts, HeaderMap},
    Json,
};
use fleet_sdk::{Credentials, MeResponse, RegisteredUser, TokenResponse};
use tracing::debug;

use super::{ApiError, ApiResult};
use crate::{
    auth::{AuthError, Identity},
    state::AppState,
};

/// The caller behind a valid bearer token.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        state.auth().verify(&token).await.map(CurrentUser).map_err(|err| {
            debug!(error = %err, "rejected bearer token");
            ApiError::Unauthorized("invalid or expired token")
        })
    }
}

/// A [`CurrentUser`] allowed to drive the main instance.
#[derive(Clone, Debug)]
pub struct MainOperator(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for MainOperator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let CurrentUser(identity) = CurrentUser::from_request_parts(parts, state).await?;
        if !identity.can_control_main {
            return Err(ApiError::Forbidden("main instance control is not permitted"));
        }
        Ok(MainOperator(identity))
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<Credentials>,
) -> ApiResult<TokenResponse> {
    let access_token = state.auth().login(&form.username, &form.password).await?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<RegisteredUser> {
    state.auth().register(&body.username, &body.password).await?;
    Ok(Json(RegisteredUser {
        username: body.username,
    }))
}

pub async fn me(CurrentUser(identity): CurrentUser) -> ApiResult<MeResponse> {
    Ok(Json(MeResponse {
        username: identity.username,
        can_control_main: identity.can_control_main,
    }))
}
