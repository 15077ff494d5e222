//! Text-to-speech route: returns raw audio bytes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use tracing::debug;
use utoipa::OpenApi;

use manifold_core::{EventKind, Modality, Provider, TtsRequest};

use crate::error::ApiError;
use crate::routes::v1::{parse_json, unknown_model, wait_unary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(speech))]
pub struct SpeechApi;

/// Register the speech route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/audio/speech", post(speech))
}

/// OpenAI text-to-speech (`POST /v1/audio/speech`).
///
/// The response body is the synthesised audio; the Content-Type comes
/// from the event's mime type (`audio/mpeg` when the callback set none).
#[utoipa::path(
    post,
    path = "/v1/audio/speech",
    tag = "audio",
    request_body(content = serde_json::Value, description = "OpenAI TTS body"),
    responses(
        (status = 200, description = "Raw audio bytes"),
        (status = 400, description = "Invalid request or unknown model"),
        (status = 503, description = "Concurrency limit reached"),
        (status = 504, description = "Model produced nothing in time"),
    )
)]
pub async fn speech(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _permit = state.admission.acquire(state.config.wait_timeout()).await?;

    let value = parse_json(&body)?;
    let request = TtsRequest::from_value(value)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid TTS request: {e}")))?;
    if request.model.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'model' field".into()));
    }
    if request.input.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'input' field".into()));
    }
    if !state.router.has(Modality::Tts, &request.model) {
        return Err(unknown_model(&state, Modality::Tts, &request.model));
    }

    debug!(model = %request.model, input_len = request.input.len(), "speech request");

    let provider = Arc::new(Provider::with_timeout(state.config.default_timeout()));
    if !state.router.route_tts(request, Arc::clone(&provider)) {
        return Err(ApiError::Internal("Failed to route request".into()));
    }

    let event = wait_unary(&provider, state.config.default_timeout()).await?;
    match event.kind {
        EventKind::AudioBytes { data, mime } => {
            let mime = if mime.is_empty() {
                "audio/mpeg".to_owned()
            } else {
                mime
            };
            Ok(([(CONTENT_TYPE, mime)], data).into_response())
        }
        other => Err(ApiError::Internal(format!(
            "TTS callback produced a non-audio event: {other:?}"
        ))),
    }
}
