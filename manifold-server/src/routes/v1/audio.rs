//! Audio transcription and translation routes (multipart upload).
//!
//! Both endpoints share one handler: the original OpenAI API treats
//! translation as transcription with a fixed target language, and which
//! of the two the callback performs is the model's business.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use tracing::debug;
use utoipa::OpenApi;

use manifold_core::encoder::json_body;
use manifold_core::{AsrRequest, Modality, Provider};

use crate::error::ApiError;
use crate::multipart;
use crate::routes::v1::{unknown_model, wait_unary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(transcriptions))]
pub struct AudioApi;

/// Register the audio routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio/transcriptions", post(transcriptions))
        .route("/audio/translations", post(transcriptions))
}

/// Speech-to-text (`POST /v1/audio/transcriptions`, `/v1/audio/translations`).
///
/// Accepts `multipart/form-data` with a `model` field and a `file` part;
/// `language`, `prompt`, `response_format`, and `temperature` are
/// forwarded to the callback.  `response_format` selects the response
/// encoding (`json`, `text`, `verbose_json`).
#[utoipa::path(
    post,
    path = "/v1/audio/transcriptions",
    tag = "audio",
    request_body(content = String, description = "multipart/form-data with model field and audio file"),
    responses(
        (status = 200, description = "Transcription result"),
        (status = 400, description = "Invalid form or unknown model"),
        (status = 503, description = "Concurrency limit reached"),
        (status = 504, description = "Model produced nothing in time"),
    )
)]
pub async fn transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _permit = state.admission.acquire(state.config.wait_timeout()).await?;

    let request = parse_asr_form(&headers, body)?;
    if request.model.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'model' field".into()));
    }
    if !state.router.has(Modality::Asr, &request.model) {
        return Err(unknown_model(&state, Modality::Asr, &request.model));
    }

    debug!(
        model = %request.model,
        audio_bytes = request.audio.len(),
        response_format = %request.response_format,
        "transcription request"
    );

    let response_format = request.response_format.clone();
    let provider = Arc::new(Provider::with_timeout(state.config.default_timeout()));
    if !state.router.route_asr(request, Arc::clone(&provider)) {
        return Err(ApiError::Internal("Failed to route request".into()));
    }

    let event = wait_unary(&provider, state.config.default_timeout()).await?;
    let (content, content_type) = json_body::transcription(&event, &response_format);
    Ok(([(CONTENT_TYPE, content_type)], content).into_response())
}

/// Build an [`AsrRequest`] from the multipart body.  The raw body is kept
/// on the request for callbacks that parse the form themselves.
fn parse_asr_form(headers: &HeaderMap, body: Bytes) -> Result<AsrRequest, ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let boundary = multipart::boundary_from_content_type(content_type).ok_or_else(|| {
        ApiError::InvalidRequest("Expected multipart/form-data with a boundary".into())
    })?;
    let form = multipart::parse(&body, &boundary)
        .ok_or_else(|| ApiError::InvalidRequest("Malformed multipart body".into()))?;

    Ok(AsrRequest {
        model: form.field("model").unwrap_or_default().to_owned(),
        language: form.field("language").unwrap_or_default().to_owned(),
        prompt: form.field("prompt").unwrap_or_default().to_owned(),
        response_format: form.field("response_format").unwrap_or("json").to_owned(),
        temperature: form
            .field("temperature")
            .and_then(|t| t.parse().ok())
            .unwrap_or(0.0),
        audio: form.file_bytes.unwrap_or_default(),
        filename: form.file_name.unwrap_or_default(),
        raw_body: body,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn form_fields_land_on_the_request() {
        let boundary = "xyz";
        let mut body = Vec::new();
        for (name, value) in [("model", "whisper-1"), ("response_format", "text")] {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"a.wav\"\r\n\r\nAUDIO\r\n--{boundary}--\r\n"
            )
            .as_bytes(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}")).unwrap(),
        );

        let req = parse_asr_form(&headers, Bytes::from(body)).unwrap();
        assert_eq!(req.model, "whisper-1");
        assert_eq!(req.response_format, "text");
        assert_eq!(req.filename, "a.wav");
        assert_eq!(&req.audio[..], b"AUDIO");
        assert!(!req.raw_body.is_empty());
    }

    #[test]
    fn non_multipart_body_is_rejected() {
        let headers = HeaderMap::new();
        let err = parse_asr_form(&headers, Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }
}
