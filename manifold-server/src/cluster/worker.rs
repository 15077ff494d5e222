//! Worker-side agent.
//!
//! Binds a local forward endpoint *first* (so the master never forwards
//! into the void), handshakes with the master's control plane, registers
//! the staged local models, and heartbeats every 5 s.  A forwarded
//! request runs through the worker's own [`ModelRouter`]; a drain task
//! serialises the provider's events into one FORWARD_RESPONSE frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use manifold_core::protocol::{
    decode_frame, encode_frame, ErrorPayload, ForwardRequestPayload, ForwardResponsePayload,
    FrameType, HandshakeAckPayload, HandshakePayload, HeartbeatPayload, ModelType,
    RegisterAckPayload, RegisterModelPayload,
};
use manifold_core::{
    AsrRequest, ChatRequest, EmbeddingRequest, EventKind, ImageGenRequest, Modality, ModelRouter,
    OutputEvent, Provider, TtsRequest,
};

use crate::cluster::local_ipv4;

/// Ports scanned when no fixed listen port is configured.
const WORKER_PORT_RANGE: std::ops::Range<u16> = 28080..28180;

/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Drain-poll granularity while collecting a forwarded response.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Where the worker's forward endpoint listens.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Interface to bind; a wildcard is advertised as the first
    /// non-loopback IPv4.
    pub listen_host: String,
    /// Fixed port, or 0 to scan the worker port range.
    pub listen_port: u16,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_owned(),
            listen_port: 0,
        }
    }
}

/// A connected worker agent.
pub struct WorkerClient {
    worker_id: String,
    master_host: String,
    master_control_port: u16,
    listen_host: String,
    listen_port: u16,
    router: Arc<ModelRouter>,
    http: reqwest::Client,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl WorkerClient {
    /// Bind the forward endpoint, handshake with the master at
    /// `master_host:master_control_port`, register every model staged in
    /// `router`, and start heartbeating.
    pub async fn connect(
        master_host: &str,
        master_control_port: u16,
        options: WorkerOptions,
        router: Arc<ModelRouter>,
    ) -> anyhow::Result<Arc<Self>> {
        let worker_id = generate_worker_id();

        // 1. Local endpoint first: the handshake advertises a reachable
        //    address, so the address must exist before the handshake.
        let listener = bind_forward_listener(&options).await?;
        let listen_port = listener.local_addr()?.port();

        let (shutdown, _) = watch::channel(false);
        let client = Arc::new(Self {
            worker_id,
            master_host: master_host.to_owned(),
            master_control_port,
            listen_host: options.listen_host.clone(),
            listen_port,
            router,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            shutdown,
        });

        client.spawn_forward_endpoint(listener);

        // 2. Handshake.
        let handshake = HandshakePayload {
            worker_id: client.worker_id.clone(),
            worker_host: client.advertised_host(),
            worker_port: listen_port,
            timestamp: Utc::now().timestamp(),
        };
        let ack = client
            .send_frame("/internal/handshake", FrameType::Handshake, &handshake)
            .await?;
        if ack.frame_type != FrameType::HandshakeAck {
            anyhow::bail!("master replied with {:?} instead of HANDSHAKE_ACK", ack.frame_type);
        }
        let ack: HandshakeAckPayload = ack.payload_as()?;
        if !ack.accepted {
            anyhow::bail!("master rejected handshake: {}", ack.message);
        }
        client.connected.store(true, Ordering::SeqCst);
        info!(
            worker_id = %client.worker_id,
            master = %format!("{master_host}:{master_control_port}"),
            listen_port,
            "connected to master"
        );

        // 3. Register the staged models; a rejected name is logged and the
        //    worker keeps serving its other models.
        client.register_staged_models().await;

        // 4. Heartbeats.
        client.spawn_heartbeat();

        Ok(client)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The address advertised to the master.
    pub fn advertised_host(&self) -> String {
        if self.listen_host == "0.0.0.0" || self.listen_host == "::" {
            local_ipv4()
        } else {
            self.listen_host.clone()
        }
    }

    /// Resolves once the agent has stopped (heartbeat failure or an
    /// explicit [`Self::disconnect`]).
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Best-effort DISCONNECT, then stop all agent tasks.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self
                .send_frame(
                    "/internal/disconnect",
                    FrameType::Disconnect,
                    &json!({"worker_id": self.worker_id}),
                )
                .await;
        }
        self.shutdown.send_replace(true);
    }

    // ── Outbound control frames ───────────────────────────────────────────

    async fn send_frame<P: serde::Serialize>(
        &self,
        path: &str,
        frame_type: FrameType,
        payload: &P,
    ) -> anyhow::Result<manifold_core::protocol::Frame> {
        let url = format!(
            "http://{}:{}{path}",
            self.master_host, self.master_control_port
        );
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE.as_str(), "application/octet-stream")
            .timeout(Duration::from_secs(10))
            .body(encode_frame(frame_type, payload))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("master returned {} for {path}", response.status());
        }
        let body = response.bytes().await?;
        Ok(decode_frame(&body)?)
    }

    async fn register_staged_models(self: &Arc<Self>) {
        for modality in [
            Modality::Chat,
            Modality::Embedding,
            Modality::Asr,
            Modality::Tts,
            Modality::ImageGen,
        ] {
            for model_name in self.router.list(modality) {
                self.register_model(modality.into(), &model_name).await;
            }
        }
    }

    /// Offer one model to the master.  Returns whether it was accepted.
    pub async fn register_model(&self, model_type: ModelType, model_name: &str) -> bool {
        let payload = RegisterModelPayload {
            worker_id: self.worker_id.clone(),
            worker_host: self.advertised_host(),
            worker_port: self.listen_port,
            model_type: model_type.as_u32(),
            model_name: model_name.to_owned(),
        };
        let ack = match self
            .send_frame("/internal/register", FrameType::RegisterModel, &payload)
            .await
        {
            Ok(frame) if frame.frame_type == FrameType::RegisterAck => frame,
            Ok(frame) => {
                warn!(model = model_name, reply = ?frame.frame_type, "unexpected register reply");
                return false;
            }
            Err(e) => {
                warn!(model = model_name, error = %e, "model registration failed");
                return false;
            }
        };
        match ack.payload_as::<RegisterAckPayload>() {
            Ok(ack) if ack.success => {
                info!(model = model_name, "model registered with master");
                true
            }
            Ok(ack) => {
                // Name collision: the master keeps serving its own; this
                // worker carries on with its remaining models.
                warn!(model = model_name, reason = %ack.message, "master rejected model registration");
                false
            }
            Err(e) => {
                warn!(model = model_name, error = %e, "malformed REGISTER_ACK");
                false
            }
        }
    }

    // ── Heartbeat ─────────────────────────────────────────────────────────

    fn spawn_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
                }
                if !client.is_connected() {
                    return;
                }
                let payload = HeartbeatPayload {
                    worker_id: client.worker_id.clone(),
                    worker_host: client.advertised_host(),
                    worker_port: client.listen_port,
                };
                let ok = matches!(
                    client
                        .send_frame("/internal/heartbeat", FrameType::Heartbeat, &payload)
                        .await,
                    Ok(frame) if frame.frame_type == FrameType::HeartbeatAck
                );
                if !ok {
                    warn!(worker_id = %client.worker_id, "heartbeat failed; disconnecting");
                    client.connected.store(false, Ordering::SeqCst);
                    client.shutdown.send_replace(true);
                    return;
                }
            }
        });
    }

    // ── Forward endpoint ──────────────────────────────────────────────────

    fn spawn_forward_endpoint(self: &Arc<Self>, listener: TcpListener) {
        let app = Router::new()
            .route("/internal/forward", post(handle_forward))
            .with_state(Arc::clone(self));
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "worker forward endpoint exited");
            }
        });
    }

    /// Route a forwarded request into the local registry.
    fn dispatch_forward(&self, model_type: ModelType, request: &Value, provider: Arc<Provider>) {
        let routed = match model_type {
            ModelType::Chat => ChatRequest::from_value(request.clone())
                .map(|req| self.router.route_chat(req, Arc::clone(&provider)))
                .unwrap_or(false),
            ModelType::Embedding => EmbeddingRequest::from_value(request.clone())
                .map(|req| self.router.route_embedding(req, Arc::clone(&provider)))
                .unwrap_or(false),
            ModelType::Asr => self
                .router
                .route_asr(AsrRequest::from_value(request), Arc::clone(&provider)),
            ModelType::Tts => TtsRequest::from_value(request.clone())
                .map(|req| self.router.route_tts(req, Arc::clone(&provider)))
                .unwrap_or(false),
            ModelType::ImageGen => ImageGenRequest::from_value(request.clone())
                .map(|req| self.router.route_image_gen(req, Arc::clone(&provider)))
                .unwrap_or(false),
        };
        if !routed {
            provider.push(OutputEvent::error(
                "model_not_found",
                "Model is not registered on this worker",
            ));
            provider.end();
        }
    }

    /// Collect the provider's events and send one FORWARD_RESPONSE.
    async fn drain_and_respond(self: Arc<Self>, request_id: String, provider: Arc<Provider>) {
        let mut chunks: Vec<Value> = Vec::new();

        loop {
            let event = match provider.wait_pop_for(DRAIN_POLL).await {
                Some(ev) => ev,
                None => {
                    if provider.is_ended() {
                        break;
                    }
                    continue;
                }
            };
            if event.is_end() {
                break;
            }
            if let EventKind::Error { code, message } = &event.kind {
                let error = ErrorPayload {
                    error_code: code.clone(),
                    error_message: message.clone(),
                };
                self.send_response(&request_id, serde_json::to_value(error).unwrap_or_default(), true)
                    .await;
                return;
            }

            let finished = matches!(
                &event.kind,
                EventKind::FinalText { finish_reason: Some(reason), .. } if reason == "stop"
            );
            if let Some(chunk) = chunk_from_event(&event) {
                chunks.push(chunk);
            }
            if finished {
                break;
            }
        }

        // A single event collapses to a flat object so unary consumers on
        // the master side see the same shape a local callback produces.
        let response = match chunks.len() {
            1 => chunks.into_iter().next().unwrap(),
            _ => json!({ "chunks": chunks }),
        };
        self.send_response(&request_id, response, false).await;
    }

    async fn send_response(&self, request_id: &str, response: Value, is_error: bool) {
        let payload = ForwardResponsePayload {
            request_id: request_id.to_owned(),
            response,
            is_error,
        };
        if let Err(e) = self
            .send_frame("/internal/response", FrameType::ForwardResponse, &payload)
            .await
        {
            warn!(%request_id, error = %e, "failed to deliver forward response");
        }
    }
}

/// Serialise one event into the forward-response chunk vocabulary.
fn chunk_from_event(event: &OutputEvent) -> Option<Value> {
    match &event.kind {
        EventKind::TextDelta { text } => Some(json!({"text": text, "is_delta": true})),
        EventKind::FinalText {
            text,
            finish_reason,
        } => {
            let mut chunk = json!({"text": text, "is_delta": false});
            if let Some(reason) = finish_reason {
                chunk["finish_reason"] = json!(reason);
            }
            Some(chunk)
        }
        EventKind::Embedding { vector } => Some(json!({"embeddings": [vector]})),
        EventKind::Embeddings { vectors } => Some(json!({"embeddings": vectors})),
        EventKind::AudioBytes { data, mime } | EventKind::ImageBytes { data, mime } => {
            use base64::Engine as _;
            Some(json!({
                "bytes_b64": base64::engine::general_purpose::STANDARD.encode(data),
                "mime_type": mime,
            }))
        }
        EventKind::Json { value } => Some(json!({"json": value})),
        EventKind::Error { .. } | EventKind::End => None,
    }
}

fn generate_worker_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("worker_{}", &hex[..8])
}

async fn bind_forward_listener(options: &WorkerOptions) -> anyhow::Result<TcpListener> {
    if options.listen_port != 0 {
        let addr = format!("{}:{}", options.listen_host, options.listen_port);
        return TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind worker endpoint {addr}: {e}"));
    }
    for port in WORKER_PORT_RANGE {
        if let Ok(listener) = TcpListener::bind((options.listen_host.as_str(), port)).await {
            return Ok(listener);
        }
    }
    anyhow::bail!(
        "no free worker port in {}..{}",
        WORKER_PORT_RANGE.start,
        WORKER_PORT_RANGE.end
    )
}

async fn handle_forward(State(client): State<Arc<WorkerClient>>, body: Bytes) -> Response {
    let frame = match decode_frame(&body) {
        Ok(frame) if frame.frame_type == FrameType::ForwardRequest => frame,
        Ok(_) | Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let Ok(payload) = frame.payload_as::<ForwardRequestPayload>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(model_type) = ModelType::try_from(payload.model_type) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    debug!(request_id = %payload.request_id, ?model_type, "forward request received");

    let provider = Arc::new(Provider::new());
    client.dispatch_forward(model_type, &payload.request, Arc::clone(&provider));
    tokio::spawn(
        Arc::clone(&client).drain_and_respond(payload.request_id.clone(), provider),
    );

    (StatusCode::OK, "OK").into_response()
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_have_the_expected_shape() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker_"));
        assert_eq!(id.len(), "worker_".len() + 8);
        assert!(id["worker_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn text_chunks_round_trip_delta_flag() {
        let delta = chunk_from_event(&OutputEvent::text_delta("a", "m")).unwrap();
        assert_eq!(delta["is_delta"], true);
        let fin =
            chunk_from_event(&OutputEvent::final_text_with_reason("done", "stop", "m")).unwrap();
        assert_eq!(fin["is_delta"], false);
        assert_eq!(fin["finish_reason"], "stop");
    }

    #[test]
    fn bytes_chunks_carry_mime() {
        let ev = OutputEvent::audio(bytes::Bytes::from_static(b"xyz"), "audio/wav", "m");
        let chunk = chunk_from_event(&ev).unwrap();
        assert_eq!(chunk["mime_type"], "audio/wav");
        assert!(chunk["bytes_b64"].is_string());
    }

    #[test]
    fn end_and_error_have_no_chunk_form() {
        assert!(chunk_from_event(&OutputEvent::end()).is_none());
        assert!(chunk_from_event(&OutputEvent::error("x", "y")).is_none());
    }
}
