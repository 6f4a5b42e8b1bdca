//! Error handling for the Quadra Server API
//!
//! This module contains standardized error handling for the API.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::error::ServerError;

/// API Error type for returning standard error responses
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),
    /// Unauthorized (401)
    Unauthorized(String),
    /// Not found (404)
    NotFound(String),
    /// Conflict (409)
    Conflict(String),
    /// Internal server error (500)
    InternalServerError(String),
    /// Wrapped server error
    ServerError(ServerError),
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError::ServerError(err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::ServerError(err) => write!(f, "Server Error: {}", err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST".to_string(), msg),
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "ERR_UNAUTHORIZED".to_string(), msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND".to_string(), msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "ERR_CONFLICT".to_string(), msg),
            ApiError::InternalServerError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL_SERVER_ERROR".to_string(),
                msg,
            ),
            ApiError::ServerError(err) => server_error_parts(&err),
        };

        let body = Json(json!({
            "error": message,
            "errorDetails": {
                "errorCode": error_code,
                "errorMessage": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Map a [`ServerError`] to the HTTP status, error code, and message of
/// its standardized API response
fn server_error_parts(err: &ServerError) -> (StatusCode, String, String) {
    match err {
        ServerError::NotFound(resource) => (
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND".to_string(),
            format!("{} not found", resource),
        ),
        ServerError::ValidationError(msg) => (
            StatusCode::BAD_REQUEST,
            "ERR_VALIDATION_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::Unauthorized(msg) => (
            StatusCode::UNAUTHORIZED,
            "ERR_UNAUTHORIZED".to_string(),
            msg.clone(),
        ),
        ServerError::UpstreamError(msg) => (
            StatusCode::BAD_GATEWAY,
            "ERR_UPSTREAM_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::EngineError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_ENGINE_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::LockServiceError(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_LOCK_SERVICE_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::ReconcileError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_RECONCILE_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::ConfigError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_CONFIG_ERROR".to_string(),
            msg.clone(),
        ),
        ServerError::InternalError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL_SERVER_ERROR".to_string(),
            msg.clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let (status, code, message) =
            server_error_parts(&ServerError::NotFound("Job abc".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "ERR_NOT_FOUND");
        assert_eq!(message, "Job abc not found");
    }

    #[test]
    fn test_validation_maps_to_400() {
        let (status, code, _) =
            server_error_parts(&ServerError::ValidationError("bad season".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "ERR_VALIDATION_ERROR");
    }
}
