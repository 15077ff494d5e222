//! Bearer-token authentication.
//!
//! Active only when an API key is configured.  Accepts both
//! `Authorization: Bearer <key>` and a bare `Authorization: <key>`, which
//! some older OpenAI client libraries still send.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(req).await;
    };

    let provided = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let authorized = provided
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v) == expected)
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}
