//! OpenAI-compatible chat-completion route.
//!
//! Unary requests wait for the single result event and render one
//! `chat.completion` JSON body.  Streamed requests (`"stream": true`)
//! attach an SSE stream that polls the provider, emits one
//! `chat.completion.chunk` per text event, and terminates with exactly
//! one `data: [DONE]` line – on producer end, on elapsed timeout, or on
//! an end event, whichever comes first.  Dropping the stream (client went
//! away) disconnects the provider so the callback learns to stop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use tracing::debug;
use utoipa::OpenApi;

use manifold_core::encoder::{json_body, sse};
use manifold_core::{ChatRequest, Modality, Provider};

use crate::error::ApiError;
use crate::routes::v1::{parse_json, unknown_model, wait_unary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(chat_completions))]
pub struct ChatApi;

/// Register the chat-completion route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// Disconnects the provider when the response stream is dropped.  After a
/// normal `[DONE]` this is a no-op; mid-stream it is how a closed TCP
/// connection reaches the producer.
struct DisconnectGuard(Arc<Provider>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// OpenAI chat completions (`POST /v1/chat/completions`).
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body(content = serde_json::Value, description = "OpenAI chat completion body"),
    responses(
        (status = 200, description = "Completion (JSON) or SSE stream"),
        (status = 400, description = "Invalid request or unknown model"),
        (status = 401, description = "Invalid API key"),
        (status = 503, description = "Concurrency limit reached"),
        (status = 504, description = "Model produced nothing in time"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _permit = state.admission.acquire(state.config.wait_timeout()).await?;

    let value = parse_json(&body)?;
    let request = ChatRequest::from_value(value)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid chat request: {e}")))?;
    if request.model.is_empty() {
        return Err(ApiError::InvalidRequest("Missing 'model' field".into()));
    }
    if !state.router.has(Modality::Chat, &request.model) {
        return Err(unknown_model(&state, Modality::Chat, &request.model));
    }

    debug!(model = %request.model, stream = request.stream, "chat completion request");

    let stream_requested = request.stream;
    let provider = Arc::new(Provider::with_timeout(state.config.default_timeout()));
    if !state.router.route_chat(request, Arc::clone(&provider)) {
        return Err(ApiError::Internal("Failed to route request".into()));
    }

    if stream_requested {
        return Ok(sse_response(provider, state.config.default_timeout()));
    }

    let event = wait_unary(&provider, state.config.default_timeout()).await?;
    Ok(Json(json_body::chat_completion(&event)).into_response())
}

struct StreamState {
    provider: Arc<Provider>,
    guard: DisconnectGuard,
    started: Instant,
    timeout: Duration,
    done: bool,
}

fn sse_response(provider: Arc<Provider>, timeout: Duration) -> Response {
    let state = StreamState {
        guard: DisconnectGuard(Arc::clone(&provider)),
        provider,
        started: Instant::now(),
        timeout,
        done: false,
    };

    let stream = stream::unfold(state, |mut st| async move {
        // The guard travels with the state so an abandoned stream
        // disconnects the provider.
        let _ = &st.guard;
        loop {
            if st.done {
                return None;
            }
            if st.started.elapsed() > st.timeout || st.provider.is_ended() {
                st.done = true;
                return Some((Ok::<Event, Infallible>(Event::default().data("[DONE]")), st));
            }
            match st.provider.wait_pop_for(Duration::from_millis(10)).await {
                None => continue,
                Some(ev) if ev.is_end() => {
                    st.done = true;
                    return Some((Ok(Event::default().data("[DONE]")), st));
                }
                Some(ev) => {
                    if let Some(chunk) = sse::chat_chunk(&ev) {
                        // A delivered chunk proves the stream is live; give
                        // the producer a fresh inactivity window.
                        st.provider.reset_timeout();
                        return Some((Ok(Event::default().data(chunk.to_string())), st));
                    }
                }
            }
        }
    });

    Sse::new(stream).into_response()
}
