//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::core::CoordinatorError;
use crate::streaming::StreamError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    /// Workflow failure, carrying the execution id when one exists
    #[error("{message}")]
    Workflow {
        message: String,
        workflow_id: Option<Uuid>,
    },
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        ApiError::Workflow {
            workflow_id: e.execution_id(),
            message: e.to_string(),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::DuplicateSession(_) => ApiError::Conflict(e.to_string()),
            StreamError::TooManySessions(_) => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Workflow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            ApiError::Workflow {
                message,
                workflow_id: Some(id),
            } => json!({ "success": false, "error": message, "workflowId": id }),
            other => json!({ "success": false, "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
