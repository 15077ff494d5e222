//! OpenAI-compatible `/v1` routes.

pub mod audio;
pub mod chat;
pub mod embeddings;
pub mod images;
pub mod models;
pub mod speech;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use serde_json::Value;

use manifold_core::{Modality, OutputEvent, Provider};

use crate::error::ApiError;
use crate::state::AppState;

/// Register every v1 route group.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(embeddings::router())
        .merge(audio::router())
        .merge(speech::router())
        .merge(images::router())
        .merge(models::router())
}

// ── Shared handler plumbing ───────────────────────────────────────────────────

/// Parse a JSON request body, surfacing the parser's message in the
/// OpenAI 400 error shape.
pub(crate) fn parse_json(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON: {e}")))
}

/// The "unknown model" rejection, listing what is available for the
/// modality.
pub(crate) fn unknown_model(state: &AppState, modality: Modality, model: &str) -> ApiError {
    let available = state.router.list(modality);
    let mut msg = format!("Model '{model}' is not available");
    if !available.is_empty() {
        msg.push_str(". Available models: ");
        msg.push_str(&available.join(", "));
    }
    ApiError::InvalidRequest(msg)
}

/// Unary response flow: wait for the single result event.
///
/// No event within the budget → 504; an error event → 400 carrying the
/// callback's error code.
pub(crate) async fn wait_unary(
    provider: &Provider,
    timeout: Duration,
) -> Result<OutputEvent, ApiError> {
    let event = provider.wait_pop_for(timeout).await.ok_or(ApiError::Timeout)?;
    if let manifold_core::EventKind::Error { code, message } = &event.kind {
        return Err(ApiError::Model {
            code: code.clone(),
            message: message.clone(),
        });
    }
    Ok(event)
}
