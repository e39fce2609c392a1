use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use crate::InstanceSnapshot;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub instance_id: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub instance_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowStatusResponse {
    pub instance_id: String,
    pub orchestration: String,
    pub status: String,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub last_event_at_ms: Option<u64>,
    pub event_count: usize,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl From<InstanceSnapshot> for WorkflowStatusResponse {
    fn from(snapshot: InstanceSnapshot) -> Self {
        Self {
            event_count: snapshot.history.len(),
            status: snapshot.status.to_string(),
            error: snapshot
                .error
                .map(|e| e.display_message())
                .or(snapshot.termination_reason.map(|r| format!("terminated: {r}"))),
            instance_id: snapshot.instance_id,
            orchestration: snapshot.orchestration,
            created_at_ms: snapshot.created_at_ms,
            completed_at_ms: snapshot.completed_at_ms,
            last_event_at_ms: snapshot.last_event_at_ms,
            output: snapshot.output,
        }
    }
}

/// Decode an optional JSON body; an empty body means "all defaults".
fn optional_json<T: Default + serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// GET / - endpoint listing and the orchestrations that can be started.
pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "message": "Durable workflow API",
        "orchestrations": state.instances.orchestrations(),
        "endpoints": {
            "health": "/health",
            "start_workflow": "/workflow/{orchestration}",
            "workflow_status": "/workflow/{instance_id}",
            "terminate_workflow": "/workflow/{instance_id}/terminate",
        },
    }))
}

/// GET /health - 503 once the background loops have stopped.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.runtime.health();
    let (status, label, message) = if health.is_healthy() {
        (StatusCode::OK, "healthy", "API and workflow runtime are running")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "workflow runtime is not running")
    };
    (
        status,
        Json(json!({
            "status": label,
            "message": message,
            "timestamp": chrono::Local::now().to_rfc3339(),
            "dispatcher_alive": health.dispatcher_alive,
        })),
    )
}

/// POST /workflow/{orchestration}
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(orchestration): Path<String>,
    body: Bytes,
) -> Result<Json<StartResponse>, ApiError> {
    let request: StartRequest = optional_json(&body)?;
    let instance_id = state
        .instances
        .schedule(request.instance_id, &orchestration, request.input.unwrap_or_default())
        .await?;
    Ok(Json(StartResponse {
        message: format!("Workflow '{orchestration}' started successfully"),
        instance_id,
        status: "started".to_string(),
    }))
}

/// GET /workflow/{instance_id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<WorkflowStatusResponse>, ApiError> {
    let snapshot = state.instances.get_state(&instance_id).await?;
    Ok(Json(snapshot.into()))
}

/// POST /workflow/{instance_id}/terminate
pub async fn terminate_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Result<Json<WorkflowStatusResponse>, ApiError> {
    let request: TerminateRequest = optional_json(&body)?;
    let reason = request.reason.unwrap_or_else(|| "terminated via API".to_string());
    state.instances.terminate(&instance_id, reason).await?;
    let snapshot = state.instances.get_state(&instance_id).await?;
    Ok(Json(snapshot.into()))
}
