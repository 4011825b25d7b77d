//! HTTP front end for external clients: log in with external auth, publish
//! with the resulting token, look up jobs, and manage minion keys.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::BrineError;
use crate::master::dispatch::PublishRequest;
use crate::master::job_cache::CacheMiss;
use crate::master::server::Master;
use crate::master::target::TargetType;
use crate::master::token::TokenCheck;
use crate::pki::KeyState;

pub const TOKEN_HEADER: &str = "x-auth-token";

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default = "default_eauth")]
    eauth: String,
}

fn default_eauth() -> String {
    "auto".to_string()
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: String,
    eauth: String,
    start: i64,
    expire: i64,
    perms: Vec<String>,
}

#[derive(Deserialize)]
struct RunRequest {
    fun: String,
    #[serde(default)]
    arg: Vec<serde_json::Value>,
    tgt: String,
    #[serde(default)]
    tgt_type: TargetType,
}

#[derive(Serialize)]
struct JobResponse {
    jid: String,
    function: String,
    target: String,
    target_type: String,
    dispatched_at: String,
    user: Option<String>,
    minions: Vec<String>,
    missing: Vec<String>,
    returns: serde_json::Value,
}

#[derive(Serialize)]
struct KeysResponse {
    accepted: Vec<String>,
    pending: Vec<String>,
    rejected: Vec<String>,
}

#[derive(Serialize)]
struct KeyActionResponse {
    id: String,
    state: KeyState,
}

/// Error body: `{"error": "..."}` with a status derived from the failure.
pub struct ApiError {
    status: StatusCode,
    message: String,
    reason: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reason: None,
        }
    }

    fn miss(miss: CacheMiss) -> Self {
        let (status, reason) = match miss {
            CacheMiss::Evicted => (StatusCode::GONE, "evicted"),
            CacheMiss::Disabled => (StatusCode::NOT_FOUND, "not_tracked"),
            CacheMiss::Unknown => (StatusCode::NOT_FOUND, "unknown"),
        };
        Self {
            status,
            message: miss.to_string(),
            reason: Some(reason),
        }
    }
}

impl From<BrineError> for ApiError {
    fn from(err: BrineError) -> Self {
        let status = match &err {
            BrineError::Authentication(_) => StatusCode::UNAUTHORIZED,
            BrineError::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            BrineError::DuplicateJobId(_) => StatusCode::CONFLICT,
            BrineError::NoTargets(_) | BrineError::InvalidTarget(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.reason {
            Some(reason) => serde_json::json!({ "error": self.message, "reason": reason }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(master: Arc<Master>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/login", post(login_handler))
        .route("/run", post(run_handler))
        .route("/jobs/:jid", get(job_handler))
        .route("/keys", get(list_keys_handler))
        .route("/keys/:id/accept", post(accept_key_handler))
        .route("/keys/:id/reject", post(reject_key_handler))
        .layer(cors)
        .with_state(master)
}

pub async fn run_api(addr: SocketAddr, master: Arc<Master>, shutdown: CancellationToken) {
    let app = router(master);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

fn token_from(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing X-Auth-Token header"))
}

/// Key management is gated by token capabilities like `key.accept`.
async fn require(master: &Master, headers: &HeaderMap, function: &str) -> Result<(), ApiError> {
    let token = token_from(headers)?;
    match master
        .tokens()
        .write()
        .await
        .validate(&token, function, Utc::now())
    {
        TokenCheck::Granted { .. } => Ok(()),
        TokenCheck::Expired => Err(ApiError::new(StatusCode::UNAUTHORIZED, "token expired")),
        TokenCheck::Unknown => Err(ApiError::new(StatusCode::UNAUTHORIZED, "unknown token")),
        TokenCheck::Denied => Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("token does not permit {}", function),
        )),
    }
}

async fn login_handler(
    State(master): State<Arc<Master>>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let token = master
        .login(&payload.username, &payload.password, &payload.eauth)
        .await?;
    Ok(Json(LoginResponse {
        token: token.token,
        user: token.subject,
        eauth: token.eauth,
        start: token.issued_at.timestamp(),
        expire: token.expires_at.timestamp(),
        perms: token.capabilities,
    }))
}

async fn run_handler(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    Json(payload): Json<RunRequest>,
) -> ApiResult<crate::master::dispatch::PublishResult> {
    let token = token_from(&headers)?;
    let request = PublishRequest::new(&payload.fun, &payload.tgt, payload.tgt_type)
        .with_args(payload.arg);
    let result = master.publish_with_token(&token, request).await?;
    Ok(Json(result))
}

async fn job_handler(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    Path(jid): Path<String>,
) -> ApiResult<JobResponse> {
    require(&master, &headers, "jobs.lookup_jid").await?;
    let job = master
        .dispatcher()
        .cache()
        .read()
        .await
        .lookup(&jid)
        .map_err(ApiError::miss)?;
    let returns = serde_json::to_value(
        job.returns
            .iter()
            .map(|(id, r)| (id.clone(), r.payload.clone()))
            .collect::<std::collections::BTreeMap<_, _>>(),
    )
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(JobResponse {
        missing: job.missing(),
        minions: job.targets.iter().cloned().collect(),
        dispatched_at: job.dispatched_at.to_rfc3339(),
        jid: job.jid,
        function: job.function,
        target: job.target,
        target_type: job.target_type,
        user: job.user,
        returns,
    }))
}

async fn list_keys_handler(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
) -> ApiResult<KeysResponse> {
    require(&master, &headers, "key.list_all").await?;
    let keys = master.keys().read().await;
    Ok(Json(KeysResponse {
        accepted: keys.list(KeyState::Accepted),
        pending: keys.list(KeyState::Pending),
        rejected: keys.list(KeyState::Rejected),
    }))
}

async fn accept_key_handler(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<KeyActionResponse> {
    require(&master, &headers, "key.accept").await?;
    let state = master
        .keys()
        .write()
        .await
        .accept(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no key for {}", id)))?;
    Ok(Json(KeyActionResponse { id, state }))
}

async fn reject_key_handler(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<KeyActionResponse> {
    require(&master, &headers, "key.reject").await?;
    let state = master
        .keys()
        .write()
        .await
        .reject(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no key for {}", id)))?;
    Ok(Json(KeyActionResponse { id, state }))
}
