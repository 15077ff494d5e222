//! Unified API error type.
//!
//! Every handler returns `Result<T, ApiError>`, which implements
//! [`axum::response::IntoResponse`] and renders the OpenAI error body
//! `{"error":{"message","type","code"}}` with the matching HTTP status,
//! so SDK clients can parse failures uniformly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use manifold_core::encoder::error_body;

/// All errors that can occur in the gateway request lifecycle.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed body, missing field, or unknown model.
    #[error("bad request: {0}")]
    InvalidRequest(String),

    /// Bearer token missing or wrong.
    #[error("invalid API key")]
    Unauthorized,

    /// No admission slot became free within the wait timeout.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The provider produced nothing within the request budget.
    #[error("request timeout")]
    Timeout,

    /// An error event surfaced by a model callback; `code` is whatever
    /// the callback chose (`model_error`, `forward_failed`, …).
    #[error("model error ({code}): {message}")]
    Model { code: String, message: String },

    /// An unclassified internal failure (e.g. routing a model that
    /// vanished between lookup and dispatch).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Model { .. } => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::RateLimited => "rate_limit_exceeded",
            ApiError::Timeout => "server_error",
            ApiError::Model { code, .. } => code,
            ApiError::Internal(_) => "server_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            ApiError::InvalidRequest(m) => m.clone(),
            ApiError::Unauthorized => "Invalid API key".to_owned(),
            ApiError::RateLimited => "Rate limit exceeded".to_owned(),
            ApiError::Timeout => "Request timeout".to_owned(),
            ApiError::Model { message, .. } => message.clone(),
            // Internal detail stays in the logs.
            ApiError::Internal(_) => "internal server error".to_owned(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!(detail = %detail, "internal server error");
        }
        let body = error_body(self.code(), &self.client_message());
        (self.status(), Json(body)).into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
