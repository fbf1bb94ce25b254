//! Asynchronous client for the fleet control plane.
//!
//! Requests carry a bearer token. When the client was given login
//! credentials it fetches a token on first use, and on a `401` it discards
//! the token, logs in again once and retries the request once.

mod types;

use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub use types::*;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Api {
        status: StatusCode,
        error: String,
        message: String,
    },
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("no token and no login credentials configured")]
    MissingCredentials,
}

impl SdkError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SdkError::Http(err) => err.status(),
            SdkError::Api { status, .. } | SdkError::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            SdkError::MissingCredentials => None,
        }
    }
}

#[derive(Clone)]
pub struct FleetClient {
    http: Client,
    base_url: String,
    login: Option<Credentials>,
    token: Arc<RwLock<Option<String>>>,
}

impl FleetClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            login: None,
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token.into()))),
            ..self
        }
    }

    /// Credentials used to obtain a token and to re-authenticate after a 401.
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Exchanges the configured credentials for a fresh token.
    pub async fn login(&self) -> Result<TokenResponse, SdkError> {
        let creds = self.login.as_ref().ok_or(SdkError::MissingCredentials)?;
        let res = self
            .http
            .post(self.url("/auth/login"))
            .form(&[
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = decode(res).await?;
        *self.token.write().await = Some(token.access_token.clone());
        debug!(username = %creds.username, "logged in");
        Ok(token)
    }

    pub async fn register(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<RegisteredUser, SdkError> {
        let body = Credentials {
            username: username.into(),
            password: password.into(),
        };
        let res = self
            .http
            .post(self.url("/auth/register"))
            .json(&body)
            .send()
            .await?;
        decode(res).await
    }

    pub async fn me(&self) -> Result<MeResponse, SdkError> {
        self.request(Method::GET, "/auth/me", None::<&()>).await
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, SdkError> {
        self.request(Method::GET, "/instances/", None::<&()>).await
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<InstanceSummary, SdkError> {
        self.request(Method::GET, &format!("/instances/{id}"), None::<&()>)
            .await
    }

    pub async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<InstanceSummary, SdkError> {
        self.request(Method::POST, "/instances/", Some(req)).await
    }

    pub async fn update_instance(
        &self,
        id: InstanceId,
        req: &UpdateInstanceRequest,
    ) -> Result<InstanceSummary, SdkError> {
        self.request(Method::PATCH, &format!("/instances/{id}"), Some(req))
            .await
    }

    pub async fn delete_instance(&self, id: InstanceId) -> Result<(), SdkError> {
        let res = self
            .send(Method::DELETE, &format!("/instances/{id}"), None::<&()>)
            .await?;
        ensure_success(res).await
    }

    pub async fn start_instance(&self, id: InstanceId) -> Result<InstanceSummary, SdkError> {
        self.lifecycle(id, "start").await
    }

    pub async fn stop_instance(&self, id: InstanceId) -> Result<InstanceSummary, SdkError> {
        self.lifecycle(id, "stop").await
    }

    pub async fn reset_instance(&self, id: InstanceId) -> Result<InstanceSummary, SdkError> {
        self.lifecycle(id, "reset").await
    }

    pub async fn instance_qr(&self, id: InstanceId) -> Result<Option<String>, SdkError> {
        let body: QrResponse = self
            .request(Method::GET, &format!("/instances/{id}/qr"), None::<&()>)
            .await?;
        Ok(body.qr)
    }

    pub async fn branches(&self) -> Result<Vec<String>, SdkError> {
        let body: BranchesResponse = self
            .request(Method::GET, "/instances/branches", None::<&()>)
            .await?;
        Ok(body.branches)
    }

    pub async fn main_status(&self) -> Result<MainStatus, SdkError> {
        self.request(Method::GET, "/instances/main/status", None::<&()>)
            .await
    }

    pub async fn start_main(&self) -> Result<MainStatus, SdkError> {
        self.request(Method::POST, "/instances/main/start", None::<&()>)
            .await
    }

    pub async fn stop_main(&self) -> Result<MainStatus, SdkError> {
        self.request(Method::POST, "/instances/main/stop", None::<&()>)
            .await
    }

    pub async fn reset_main(&self) -> Result<MainStatus, SdkError> {
        self.request(Method::POST, "/instances/main/reset", None::<&()>)
            .await
    }

    pub async fn main_qr(&self) -> Result<Option<String>, SdkError> {
        let body: QrResponse = self
            .request(Method::GET, "/instances/main/qr", None::<&()>)
            .await?;
        Ok(body.qr)
    }

    async fn lifecycle(&self, id: InstanceId, action: &str) -> Result<InstanceSummary, SdkError> {
        self.request(Method::POST, &format!("/instances/{id}/{action}"), None::<&()>)
            .await
    }

    async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let res = self.send(method, path, body).await?;
        decode(res).await
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Response, SdkError>
    where
        B: Serialize + ?Sized,
    {
        let token = self.bearer().await?;
        let res = self.build(method.clone(), path, body, &token).send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }
        self.token.write().await.take();
        if self.login.is_none() {
            return Ok(res);
        }

        debug!(path, "token rejected; re-authenticating");
        let token = self.login().await?.access_token;
        let res = self.build(method, path, body, &token).send().await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            self.token.write().await.take();
        }
        Ok(res)
    }

    fn build<B>(&self, method: Method, path: &str, body: Option<&B>, token: &str) -> RequestBuilder
    where
        B: Serialize + ?Sized,
    {
        let builder = self
            .http
            .request(method, self.url(path))
            .bearer_auth(token);
        match body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    async fn bearer(&self) -> Result<String, SdkError> {
        if let Some(token) = self.token().await {
            return Ok(token);
        }
        Ok(self.login().await?.access_token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, SdkError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        Err(error_from(res).await)
    }
}

async fn ensure_success(res: Response) -> Result<(), SdkError> {
    if res.status().is_success() {
        Ok(())
    } else {
        Err(error_from(res).await)
    }
}

async fn error_from(res: Response) -> SdkError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(ApiErrorBody { error, message }) => SdkError::Api {
            status,
            error,
            message,
        },
        Err(_) => SdkError::UnexpectedStatus { status, body },
    }
}
