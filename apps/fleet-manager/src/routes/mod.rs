mod auth;
mod instances;
mod main_instance;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_sdk::ApiErrorBody;
use tracing::error;

use crate::{auth::AuthError, error::SupervisorError, metrics, state::AppState};

pub use auth::{CurrentUser, MainOperator};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(export_metrics))
        .route("/auth/login", post(auth::login))
        .route("/auth/register", post(auth::register))
        .route("/auth/me", get(auth::me))
        .route(
            "/instances/",
            get(instances::list).post(instances::create),
        )
        .route("/instances/branches", get(instances::branches))
        .route("/instances/main/status", get(main_instance::status))
        .route("/instances/main/start", post(main_instance::start))
        .route("/instances/main/stop", post(main_instance::stop))
        .route("/instances/main/reset", post(main_instance::reset))
        .route("/instances/main/qr", get(main_instance::qr))
        .route(
            "/instances/:id",
            get(instances::get_one)
                .patch(instances::update)
                .delete(instances::delete),
        )
        .route("/instances/:id/start", post(instances::start))
        .route("/instances/:id/stop", post(instances::stop))
        .route("/instances/:id/reset", post(instances::reset))
        .route("/instances/:id/qr", get(instances::qr))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn export_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_prometheus(),
    )
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        (
            status,
            Json(ApiErrorBody {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SupervisorError::AlreadyExists(_) | SupervisorError::AlreadyRunning(_) => {
                ApiError::Conflict(err.to_string())
            }
            SupervisorError::InvalidName(_)
            | SupervisorError::MissingRepository
            | SupervisorError::SourceControl(_) => ApiError::BadRequest(err.to_string()),
            other => {
                error!(error = %other, "instance operation failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::Unauthorized("invalid username or password"),
            AuthError::MissingToken => ApiError::Unauthorized("missing bearer token"),
            AuthError::Jwt(_) | AuthError::UnknownUser(_) => {
                ApiError::Unauthorized("invalid or expired token")
            }
            AuthError::UserExists(_) => ApiError::Conflict(err.to_string()),
            AuthError::InvalidUsername(_) | AuthError::WeakPassword => {
                ApiError::BadRequest(err.to_string())
            }
            AuthError::Hash(_) => {
                error!(error = %err, "password hashing failed");
                ApiError::Internal("password hashing failed".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use fleet_sdk::{InstanceStatus, InstanceSummary, MainStatus, MeResponse, TokenResponse};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use super::*;
    use crate::{
        auth::{AuthConfig, AuthContext},
        main_instance::{MainInstance, MainInstanceConfig},
        registry::InstanceRegistry,
        supervisor::{Supervisor, SupervisorConfig},
        testing::{FakeLauncher, FakeSource},
    };

    struct TestApp {
        _tmp: tempfile::TempDir,
        root: std::path::PathBuf,
        app: Router,
        auth: AuthContext,
    }

    async fn test_app() -> TestApp {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let launcher = Arc::new(FakeLauncher::default());
        let auth = AuthContext::new(AuthConfig {
            secret: b"router-test-secret".to_vec(),
            token_ttl: Duration::from_secs(600),
            main_operators: vec!["root".into()],
        });
        auth.register("root", "rootpassword").await.unwrap();
        auth.register("ops", "opspassword").await.unwrap();

        let supervisor = Supervisor::new(
            SupervisorConfig {
                instances_dir: root.join("instances"),
                default_repo_url: Some("https://example.com/bot.git".into()),
                qr_max_age: Duration::from_secs(30),
            },
            InstanceRegistry::load(root.join("data/instances.json")).unwrap(),
            launcher.clone(),
            Arc::new(FakeSource::default()),
        );
        let main = MainInstance::new(
            MainInstanceConfig {
                workdir: root.join("main"),
                env_path: None,
                pid_file: root.join("data/main.pid"),
                qr_max_age: Duration::from_secs(30),
            },
            launcher,
        );
        let app = build_router(AppState::new(supervisor, main, auth.clone()));
        TestApp {
            _tmp: tmp,
            root,
            app,
            auth,
        }
    }

    impl TestApp {
        fn token(&self, username: &str) -> String {
            self.auth.issue_token(username).unwrap()
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Vec<u8>) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, bytes.to_vec())
        }
    }

    #[tokio::test]
    async fn health_and_metrics_are_public() {
        let t = test_app().await;
        let (status, body) = t.call("GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        let (status, body) = t.call("GET", "/metrics", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("running_instances"));
    }

    #[tokio::test]
    async fn instance_routes_require_a_valid_token() {
        let t = test_app().await;
        let (status, body) = t.call("GET", "/instances/", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let err: ApiErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "unauthorized");
        assert_eq!(err.message, "missing bearer token");

        let (status, body) = t.call("GET", "/instances/", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let err: ApiErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.message, "invalid or expired token");
    }

    #[tokio::test]
    async fn register_login_and_me() {
        let t = test_app().await;
        let (status, _) = t
            .call(
                "POST",
                "/auth/register",
                None,
                Some(json!({"username": "newbie", "password": "longenough"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = t
            .call(
                "POST",
                "/auth/register",
                None,
                Some(json!({"username": "newbie", "password": "longenough"})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("username=newbie&password=longenough"))
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let token: TokenResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(token.token_type, "bearer");

        let (status, body) = t
            .call("GET", "/auth/me", Some(&token.access_token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let me: MeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(me.username, "newbie");
        assert!(!me.can_control_main);

        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("username=newbie&password=wrong-password"))
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn instance_lifecycle_over_http() {
        let t = test_app().await;
        let token = t.token("ops");

        let (status, body) = t
            .call(
                "POST",
                "/instances/",
                Some(&token),
                Some(json!({"name": "sales", "port": 3001})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let created: InstanceSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.status, InstanceStatus::Stopped);
        let base = format!("/instances/{}", created.id);

        let (status, body) = t
            .call("POST", &format!("{base}/start"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let started: InstanceSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(started.status, InstanceStatus::Running);

        let (status, body) = t
            .call("POST", &format!("{base}/start"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ApiErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(err.message.contains("sales"));

        let (status, body) = t
            .call("GET", &format!("{base}/qr"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"qr": null}));

        let (status, body) = t
            .call(
                "PATCH",
                &base,
                Some(&token),
                Some(json!({"version": "v2"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let updated: InstanceSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(updated.version.as_deref(), Some("v2"));
        assert_eq!(updated.status, InstanceStatus::Running);

        let (status, body) = t.call("DELETE", &base, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert!(!t.root.join("instances/sales").exists());

        let (status, body) = t.call("GET", "/instances/", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<InstanceSummary> = serde_json::from_slice(&body).unwrap();
        assert!(listed.is_empty());

        let (status, _) = t.call("POST", &format!("{base}/stop"), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_ids_and_names_are_bad_requests() {
        let t = test_app().await;
        let token = t.token("ops");
        let (status, body) = t
            .call("POST", "/instances/abc/start", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ApiErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "bad_request");

        let (status, _) = t
            .call(
                "POST",
                "/instances/",
                Some(&token),
                Some(json!({"name": "has space"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn main_instance_requires_the_operator_capability() {
        let t = test_app().await;
        let ops = t.token("ops");
        let (status, body) = t
            .call("GET", "/instances/main/status", Some(&ops), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let err: ApiErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "forbidden");

        let root = t.token("root");
        let (status, body) = t
            .call("GET", "/instances/main/status", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let status_body: MainStatus = serde_json::from_slice(&body).unwrap();
        assert!(!status_body.running);

        let (status, body) = t
            .call("POST", "/instances/main/start", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let started: MainStatus = serde_json::from_slice(&body).unwrap();
        assert!(started.running);
        assert!(t.root.join("data/main.pid").exists());

        let (status, body) = t
            .call("GET", "/instances/main/qr", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"qr": null}));

        let (status, body) = t
            .call("POST", "/instances/main/stop", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let stopped: MainStatus = serde_json::from_slice(&body).unwrap();
        assert!(!stopped.running);
    }
}
