//! Status/Polling Gateway
//!
//! Thin HTTP layer over the lifecycle controller, serving the protocol the
//! challenge web client polls:
//!
//! - `POST /challenge/:id/start`  — launch (or return) the caller's instance
//! - `POST /challenge/:id/stop`   — tear the instance down
//! - `GET  /challenge/:id/status` — running/absent view with fresh expiry
//! - `GET  /challenge/:id/pool`   — pool occupancy
//! - `GET  /health`               — liveness
//!
//! The gateway holds no state of its own; remaining time is recomputed from
//! `expires_at` on every poll, never cached, since the client runs its own
//! countdown between polls.

use crate::auth::TokenValidator;
use crate::lifecycle::{InstanceError, InstanceManager, PoolStatus};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

// ============================================================================
// SHARED STATE
// ============================================================================

pub struct GatewayState {
    pub manager: Arc<InstanceManager>,
    pub auth: TokenValidator,
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub port: u16,
    pub expires_at: String,
    pub credential_hint: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerView>,
}

#[derive(Debug, Serialize)]
pub struct ContainerView {
    pub port: u16,
    pub expires_at: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn json_error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Map controller errors to wire status codes. Messages stay one line;
/// internal detail never leaks past them.
fn error_response(err: InstanceError) -> ApiError {
    let code = match &err {
        InstanceError::PoolExhausted | InstanceError::Provision(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        InstanceError::NotFound => StatusCode::NOT_FOUND,
        InstanceError::Teardown(_) | InstanceError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(code, err.to_string())
}

fn authorize(auth: &TokenValidator, headers: &HeaderMap) -> Result<i64, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    auth.user_id(value)
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "invalid bearer token"))
}

// ============================================================================
// HANDLERS
// ============================================================================

/// POST /challenge/:id/start
pub async fn start_instance(
    State(state): State<Arc<GatewayState>>,
    Path(challenge_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<StartResponse>, ApiError> {
    let user_id = authorize(&state.auth, &headers)?;

    let record = state
        .manager
        .start(user_id, challenge_id)
        .await
        .map_err(error_response)?;

    Ok(Json(StartResponse {
        port: record.port,
        expires_at: record.expires_at.to_rfc3339(),
        credential_hint: record.credential_hint,
    }))
}

/// POST /challenge/:id/stop
pub async fn stop_instance(
    State(state): State<Arc<GatewayState>>,
    Path(challenge_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<StopResponse>, ApiError> {
    let user_id = authorize(&state.auth, &headers)?;

    state
        .manager
        .stop(user_id, challenge_id)
        .await
        .map_err(error_response)?;

    Ok(Json(StopResponse { stopped: true }))
}

/// GET /challenge/:id/status
pub async fn instance_status(
    State(state): State<Arc<GatewayState>>,
    Path(challenge_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let user_id = authorize(&state.auth, &headers)?;

    let record = state
        .manager
        .status(user_id, challenge_id)
        .map_err(error_response)?;

    Ok(Json(match record {
        Some(r) => StatusResponse {
            status: "running",
            container: Some(ContainerView {
                port: r.port,
                expires_at: r.expires_at.to_rfc3339(),
            }),
        },
        None => StatusResponse {
            status: "absent",
            container: None,
        },
    }))
}

/// GET /challenge/:id/pool
pub async fn pool_status(
    State(state): State<Arc<GatewayState>>,
    Path(challenge_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<PoolStatus>, ApiError> {
    authorize(&state.auth, &headers)?;

    let stats = state
        .manager
        .pool_status(challenge_id)
        .map_err(error_response)?;
    Ok(Json(stats))
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

// ============================================================================
// ROUTER / STARTUP
// ============================================================================

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/challenge/:id/start", post(start_instance))
        .route("/challenge/:id/stop", post(stop_instance))
        .route("/challenge/:id/status", get(instance_status))
        .route("/challenge/:id/pool", get(pool_status))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn run_server(state: Arc<GatewayState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Instance gateway listening on {}", addr);
    info!("  POST /challenge/:id/start  - launch instance");
    info!("  POST /challenge/:id/stop   - tear down instance");
    info!("  GET  /challenge/:id/status - poll instance state");
    info!("  GET  /challenge/:id/pool   - pool occupancy");

    axum::serve(listener, app).await?;

    Ok(())
}
