//! OpenAI-compatible embeddings route.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;
use utoipa::OpenApi;

use manifold_core::encoder::json_body;
use manifold_core::{EmbeddingRequest, Modality, Provider};

use crate::error::ApiError;
use crate::routes::v1::{parse_json, unknown_model, wait_unary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(embeddings))]
pub struct EmbeddingsApi;

/// Register the embeddings route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/embeddings", post(embeddings))
}

/// OpenAI embeddings (`POST /v1/embeddings`).
#[utoipa::path(
    post,
    path = "/v1/embeddings",
    tag = "embeddings",
    request_body(content = serde_json::Value, description = "OpenAI embeddings body"),
    responses(
        (status = 200, description = "Embedding list"),
        (status = 400, description = "Invalid request or unknown model"),
        (status = 503, description = "Concurrency limit reached"),
        (status = 504, description = "Model produced nothing in time"),
    )
)]
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.admission.acquire(state.config.wait_timeout()).await?;

    let value = parse_json(&body)?;
    let request = EmbeddingRequest::from_value(value)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid embeddings request: {e}")))?;
    if request.model.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'model' field".into()));
    }
    if request.input.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'input' field".into()));
    }
    if !state.router.has(Modality::Embedding, &request.model) {
        return Err(unknown_model(&state, Modality::Embedding, &request.model));
    }

    debug!(model = %request.model, inputs = request.input.len(), "embeddings request");

    let provider = Arc::new(Provider::with_timeout(state.config.default_timeout()));
    if !state.router.route_embedding(request, Arc::clone(&provider)) {
        return Err(ApiError::Internal("Failed to route request".into()));
    }

    let event = wait_unary(&provider, state.config.default_timeout()).await?;
    Ok(Json(json_body::embedding_list(&event)))
}
