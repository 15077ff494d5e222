//! Image generation route (DALL·E-shaped responses).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;
use utoipa::OpenApi;

use manifold_core::encoder::json_body;
use manifold_core::{ImageGenRequest, Modality, Provider};

use crate::error::ApiError;
use crate::routes::v1::{parse_json, unknown_model, wait_unary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(image_generations))]
pub struct ImagesApi;

/// Register the image-generation route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/images/generations", post(image_generations))
}

/// OpenAI image generation (`POST /v1/images/generations`).
#[utoipa::path(
    post,
    path = "/v1/images/generations",
    tag = "images",
    request_body(content = serde_json::Value, description = "OpenAI image generation body"),
    responses(
        (status = 200, description = "Generated images (b64_json or URLs)"),
        (status = 400, description = "Invalid request or unknown model"),
        (status = 503, description = "Concurrency limit reached"),
        (status = 504, description = "Model produced nothing in time"),
    )
)]
pub async fn image_generations(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.admission.acquire(state.config.wait_timeout()).await?;

    let value = parse_json(&body)?;
    let request = ImageGenRequest::from_value(value)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid image request: {e}")))?;
    if request.prompt.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'prompt' field".into()));
    }
    if !state.router.has(Modality::ImageGen, &request.model) {
        return Err(unknown_model(&state, Modality::ImageGen, &request.model));
    }

    debug!(model = %request.model, prompt_len = request.prompt.len(), "image generation request");

    let provider = Arc::new(Provider::with_timeout(state.config.default_timeout()));
    if !state.router.route_image_gen(request, Arc::clone(&provider)) {
        return Err(ApiError::Internal("Failed to route request".into()));
    }

    let event = wait_unary(&provider, state.config.default_timeout()).await?;
    Ok(Json(json_body::image_list(&event)))
}
