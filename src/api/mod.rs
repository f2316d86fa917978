//! JSON HTTP API used by worker hosts, the exam flow, the operator console
//! and the remote-desktop gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::VdiError;
use crate::pool::{Desktop, DesktopPool, NewDesktop, UserId};
use crate::registry::{HeartbeatInput, StatusChange, WorkerRegistry, WorkerView};
use crate::session::{Allocation, ExamId, SessionAllocator};
use crate::token::{ConnectionDescriptor, TokenSealer};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<WorkerRegistry>,
    pub pool: DesktopPool,
    pub allocator: SessionAllocator,
    pub sealer: TokenSealer,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

#[derive(Serialize)]
struct AckResponse {
    success: bool,
    released: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest {
    user_id: UserId,
    exam_id: ExamId,
    #[serde(default)]
    width: Option<Value>,
    #[serde(default)]
    height: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    user_id: UserId,
    exam_id: ExamId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityRequest {
    user_id: UserId,
    #[serde(default)]
    exam_id: Option<ExamId>,
}

#[derive(Deserialize)]
struct OpenTokenRequest {
    token: String,
}

/// Error wrapper that renders a [`VdiError`] as a JSON response.
pub struct ApiError(pub VdiError);

impl From<VdiError> for ApiError {
    fn from(e: VdiError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            VdiError::PoolExhausted | VdiError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            VdiError::WorkerBusy { .. } => StatusCode::CONFLICT,
            VdiError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            VdiError::TokenInvalid(_) => StatusCode::UNAUTHORIZED,
            VdiError::InvalidRequest(_) | VdiError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            VdiError::Storage(_) | VdiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match self.0 {
            VdiError::TokenInvalid(_) => "invalid token".to_string(),
            ref other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the API router. Exposed so tests can drive it in-process.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cluster", get(cluster_summary_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/schedulable", get(schedulable_workers_handler))
        .route("/api/workers/heartbeat", post(heartbeat_handler))
        .route("/api/workers/:code/status", post(set_status_handler))
        .route("/api/desktops", get(list_desktops_handler).post(provision_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/allocate", post(allocate_handler))
        .route("/api/sessions/release", post(release_handler))
        .route("/api/activity", post(activity_handler))
        .route("/api/tokens/open", post(open_token_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, cancel: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn cluster_summary_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.cluster_summary().await)
}

async fn list_workers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.all_workers().await)
}

async fn schedulable_workers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.schedulable_workers().await)
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Json(input): Json<HeartbeatInput>,
) -> ApiResult<WorkerView> {
    Ok(Json(state.registry.heartbeat(input).await?))
}

async fn set_status_handler(
    State(state): State<ApiState>,
    Path(code): Path<String>,
    Json(change): Json<StatusChange>,
) -> ApiResult<WorkerView> {
    Ok(Json(state.registry.set_status(&code, change).await?))
}

async fn list_desktops_handler(
    State(state): State<ApiState>,
) -> ApiResult<Vec<Desktop>> {
    Ok(Json(state.pool.list().await?))
}

async fn provision_handler(
    State(state): State<ApiState>,
    Json(desktops): Json<Vec<NewDesktop>>,
) -> ApiResult<Vec<Desktop>> {
    Ok(Json(state.pool.provision(desktops).await?))
}

async fn list_sessions_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.allocator.bindings().list().await)
}

async fn allocate_handler(
    State(state): State<ApiState>,
    Json(req): Json<AllocateRequest>,
) -> ApiResult<Allocation> {
    let allocation = state
        .allocator
        .allocate_with_display(req.user_id, req.exam_id, req.width.as_ref(), req.height.as_ref())
        .await?;
    Ok(Json(allocation))
}

async fn release_handler(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<AckResponse> {
    let released = state.allocator.release(req.user_id, req.exam_id).await?;
    Ok(Json(AckResponse {
        success: true,
        released,
    }))
}

async fn activity_handler(
    State(state): State<ApiState>,
    Json(req): Json<ActivityRequest>,
) -> Result<StatusCode, ApiError> {
    state.allocator.record_activity(req.user_id, req.exam_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn open_token_handler(
    State(state): State<ApiState>,
    Json(req): Json<OpenTokenRequest>,
) -> ApiResult<ConnectionDescriptor> {
    let descriptor = state.sealer.open(&req.token).map_err(VdiError::from)?;
    Ok(Json(descriptor))
}
