//! API error type mapping runtime errors to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::Error;

#[derive(Debug)]
pub enum ApiError {
    Runtime(Error),
    /// Malformed request body.
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Runtime(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Runtime(e @ Error::InstanceNotFound(_)) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND", e.to_string()),
            ApiError::Runtime(e @ Error::UnknownOrchestration(_)) => {
                (StatusCode::NOT_FOUND, "UNKNOWN_ORCHESTRATION", e.to_string())
            }
            ApiError::Runtime(e @ Error::InstanceAlreadyExists(_)) => {
                (StatusCode::CONFLICT, "INSTANCE_ALREADY_EXISTS", e.to_string())
            }
            ApiError::Runtime(e @ Error::InvalidInstanceId { .. }) => {
                (StatusCode::BAD_REQUEST, "INVALID_INSTANCE_ID", e.to_string())
            }
            ApiError::Runtime(e @ Error::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", e.to_string()),
            ApiError::Runtime(e @ Error::Provider(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(target: "duraflow::server", %code, %message, "request failed");
        }
        let body = json!({
            "error": {
                "code": code,
                "message": message,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, axum::Json(body)).into_response()
    }
}
