//! JSON error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::error::BridgeError;

/// Error returned by every handler: `{"ok": false, "error", "code"}`.
#[derive(Debug)]
pub enum ApiError {
    Bridge(BridgeError),
    /// No usable caller identity.
    Unauthenticated,
    /// The request body or query could not be decoded.
    BadRequest(String),
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        ApiError::Bridge(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "Missing or invalid x-user-id header".into(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Bridge(err) => match err {
                BridgeError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", err.to_string()),
                BridgeError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
                BridgeError::Conflict(_) => (StatusCode::CONFLICT, "conflict", err.to_string()),
                BridgeError::Validation(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation_error",
                    err.to_string(),
                ),
                BridgeError::InvalidTransition { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invalid_transition",
                    err.to_string(),
                ),
                BridgeError::ReconnectRequired => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "reconnect_required",
                    err.to_string(),
                ),
                BridgeError::Provider(_) => {
                    (StatusCode::BAD_GATEWAY, "provider_error", err.to_string())
                }
                BridgeError::LocalResource(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "local_resource_error",
                    "File storage is unavailable".into(),
                ),
                BridgeError::Database(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".into(),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        match &self {
            ApiError::Bridge(BridgeError::Database(e)) => error!("Request failed: {e}"),
            ApiError::Bridge(e @ BridgeError::LocalResource(_)) => error!("Request failed: {e}"),
            _ => {}
        }
        (
            status,
            Json(serde_json::json!({ "ok": false, "error": message, "code": code })),
        )
            .into_response()
    }
}
