//! Error taxonomy for the alert subsystem.
//!
//! Critical-path failures (validation, rate limiting, persistence) abort the
//! request and map to HTTP statuses here. Best-effort failures (fanout,
//! email) never become an [`AlertError`]: they are logged at the call site
//! and discarded, so they cannot fail the operation that triggered them.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AlertError {
    /// Malformed or incomplete submission; nothing was persisted.
    #[error("invalid submission: {0}")]
    Validation(String),

    /// The caller key exceeded its submission window.
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No alert with the given id.
    #[error("alert not found")]
    NotFound,

    /// The persistence layer is unreachable or failed mid-operation.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl AlertError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AlertError::Validation(msg.into())
    }
}

impl IntoResponse for AlertError {
    fn into_response(self) -> Response {
        match self {
            AlertError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation", "message": message })),
            )
                .into_response(),
            AlertError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "rate_limited",
                        "retry_after_secs": retry_after_secs,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            AlertError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "message": "alert not found" })),
            )
                .into_response(),
            AlertError::Unavailable(e) => {
                // Internal detail stays in the log, not the response body
                error!(error = %e, "Storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "service_unavailable" })),
                )
                    .into_response()
            }
        }
    }
}
