//! Workflow endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::error::ApiError;
use super::{sse_response, AppState};
use crate::core::RunOptions;
use crate::domain::ExecutionStatus;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowRequest {
    pub workflow_name: Option<String>,
    pub inputs: Option<Value>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Session id for `/api/workflows/stream`
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RunWorkflowRequest {
    fn required(&self) -> Result<(String, Value), ApiError> {
        match (&self.workflow_name, &self.inputs) {
            (Some(name), Some(inputs)) if !name.trim().is_empty() => {
                Ok((name.clone(), inputs.clone()))
            }
            _ => Err(ApiError::BadRequest(
                "workflowName and inputs are required".to_string(),
            )),
        }
    }
}

/// POST /api/workflows/run
pub async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (name, inputs) = request.required()?;

    if request.run_async {
        let id = state
            .coordinator
            .submit(&name, inputs, request.options)
            .await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "workflowName": name,
                "async": true,
                "workflowId": id,
            })),
        ));
    }

    let execution = state
        .coordinator
        .run_workflow_with(&name, inputs, request.options)
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": execution.success,
            "workflowId": execution.id,
            "workflowName": name,
            "strategy": execution.strategy,
            "result": execution.result,
            "duration": execution.duration_ms,
        })),
    ))
}

/// POST /api/workflows/stream
///
/// Runs a named workflow and reports progress as Server-Sent Events.
pub async fn stream_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (name, inputs) = request.required()?;
    if state.coordinator.workflow(&name).await.is_none() {
        return Err(ApiError::NotFound(format!("Unknown workflow: {}", name)));
    }

    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let rx = state.open_channel(&session_id).await?;

    let coordinator = state.coordinator.clone();
    let streams = state.streams.clone();
    let sid = session_id.clone();
    tokio::spawn(async move {
        // Outcome is reported on the session
        let _ = coordinator
            .run_workflow_streamed(&name, inputs, &streams, &sid)
            .await;
    });

    Ok(sse_response(session_id, rx))
}

/// GET /api/workflows/{id}/status
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid workflow id: {}", id)))?;

    let status = state.coordinator.execution_status(id).await;
    let code = match status {
        ExecutionStatus::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    info!(workflow_id = %id, status = ?code, "Workflow status lookup");
    Ok((code, Json(status)))
}
