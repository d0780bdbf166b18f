//! Streaming endpoints.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::{sse_response, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub provider: Option<String>,
    pub operation: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// POST /api/stream
///
/// Opens a session, relays the provider stream onto it, and returns the
/// session as Server-Sent Events. Dropping the response closes the
/// session with `client_disconnect`.
pub async fn start_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (provider, operation) = match (request.provider, request.operation) {
        (Some(p), Some(o)) => (p, o),
        _ => {
            return Err(ApiError::BadRequest(
                "provider and operation are required".to_string(),
            ))
        }
    };
    if state.coordinator.provider(&provider).await.is_none() {
        return Err(ApiError::NotFound(format!("Unknown provider: {}", provider)));
    }

    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let rx = state.open_channel(&session_id).await?;
    info!(session_id = %session_id, provider = %provider, operation = %operation, "Stream started");

    let coordinator = state.coordinator.clone();
    let streams = state.streams.clone();
    let sid = session_id.clone();
    let input = request.input;
    tokio::spawn(async move {
        if let Err(e) = coordinator
            .stream_operation(&streams, &sid, &provider, &operation, input)
            .await
        {
            warn!(session_id = %sid, error = %e, "Stream relay failed");
        }
    });

    Ok(sse_response(session_id, rx))
}

/// DELETE /api/stream/{id}
pub async fn cancel_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.streams.cancel(&id).await {
        Ok(Json(json!({ "success": true, "sessionId": id })))
    } else {
        Err(ApiError::NotFound(format!("No active stream: {}", id)))
    }
}
