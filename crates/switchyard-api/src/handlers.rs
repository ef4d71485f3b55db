//! REST API handlers.
//!
//! Each handler reads or mutates the registry and session store and
//! returns JSON responses.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use switchyard_core::{ENDPOINT_TAG, InstanceMetadata, ResourceUsage};
use switchyard_registry::RegistryError;

use crate::ApiState;
use crate::prometheus::{PoolMetrics, render_prometheus};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn registry_error(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::CapacityExceeded { .. }
        | RegistryError::NotRoutable { .. }
        | RegistryError::AtCapacity(_) => StatusCode::CONFLICT,
        RegistryError::NoAvailableInstance => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(&e.to_string(), status)
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "instances": state.registry.len(),
        "sessions": state.sessions.len(),
        "uptimeSecs": state.started.elapsed().as_secs(),
    }))
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.instances())
}

/// GET /api/v1/instances/:id
pub async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.registry.get_instance(&id) {
        Some(instance) => ApiResponse::ok(instance).into_response(),
        None => error_response("instance not found", StatusCode::NOT_FOUND),
    }
}

/// Body for registering an externally started instance.
#[derive(Debug, serde::Deserialize)]
pub struct RegisterInstance {
    pub endpoint: Option<String>,
    #[serde(default)]
    pub metadata: InstanceMetadata,
}

/// POST /api/v1/instances
pub async fn register_instance(
    State(state): State<ApiState>,
    Json(req): Json<RegisterInstance>,
) -> Response {
    let mut metadata = req.metadata;
    if let Some(endpoint) = req.endpoint {
        metadata.insert(ENDPOINT_TAG.to_string(), endpoint);
    }
    // The endpoint may arrive either as a field or as a metadata tag.
    if let Some(endpoint) = metadata.get(ENDPOINT_TAG)
        && !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://"))
    {
        return error_response(
            "endpoint must be a ws:// or wss:// URL",
            StatusCode::BAD_REQUEST,
        );
    }

    match state.registry.create_instance(metadata) {
        Ok(instance) => {
            info!(instance_id = %instance.id, endpoint = ?instance.endpoint, "instance registered via API");
            (StatusCode::CREATED, ApiResponse::ok(instance)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "instance registration rejected");
            registry_error(e)
        }
    }
}

/// DELETE /api/v1/instances/:id
pub async fn delete_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.autoscaler.remove_instance(&id).await {
        Some(instance) => {
            info!(instance_id = %id, "instance removed via API");
            ApiResponse::ok(instance).into_response()
        }
        None => error_response("instance not found", StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/instances/:id/usage
pub async fn report_usage(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(usage): Json<ResourceUsage>,
) -> Response {
    if usage.cpu < 0.0 || usage.memory < 0.0 || usage.throughput < 0.0 {
        return error_response("usage values must not be negative", StatusCode::BAD_REQUEST);
    }
    match state.registry.report_usage(&id, usage) {
        Ok(()) => ApiResponse::ok(usage).into_response(),
        Err(e) => registry_error(e),
    }
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct SessionQuery {
    pub user_id: Option<String>,
}

/// GET /api/v1/sessions?user_id=
pub async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let sessions = match query.user_id.as_deref() {
        Some(user_id) => state.sessions.get_user_sessions(user_id),
        None => state.sessions.sessions(),
    };
    ApiResponse::ok(sessions)
}

/// DELETE /api/v1/sessions/:id
pub async fn delete_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.sessions.remove_session(&id) {
        Some(session) => ApiResponse::ok(session).into_response(),
        None => error_response("session not found", StatusCode::NOT_FOUND),
    }
}

// ── Connections ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct ConnectionQuery {
    pub instance_id: Option<String>,
}

/// GET /api/v1/connections?instance_id=
pub async fn list_connections(
    State(state): State<ApiState>,
    Query(query): Query<ConnectionQuery>,
) -> impl IntoResponse {
    let mut connections = state.connections.list();
    if let Some(instance_id) = query.instance_id.as_deref() {
        connections.retain(|c| c.instance_id == instance_id);
    }
    ApiResponse::ok(connections)
}

/// GET /api/v1/connections/:id
pub async fn get_connection(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.connections.get(&id) {
        Some(connection) => ApiResponse::ok(connection).into_response(),
        None => error_response("connection not found", StatusCode::NOT_FOUND),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let instances = state.registry.instances();
    let body = render_prometheus(&PoolMetrics {
        instances: &instances,
        sessions: state.sessions.len(),
        strategy: state.registry.strategy(),
        max_instances: state.registry.max_instances(),
        uptime_secs: state.started.elapsed().as_secs(),
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
