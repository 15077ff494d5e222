//! Master-side worker manager.
//!
//! Owns the cluster's view of the world: which workers are alive, which
//! model belongs to which worker, and which forwarded requests are still
//! in flight.  All three maps sit under one mutex – registration and
//! heartbeats are rare, correlation lookups are cheap, and a single lock
//! keeps the invariants (`model_to_worker` entries always point at a live
//! worker) easy to maintain.
//!
//! Accepted worker models are surfaced to clients by registering a
//! forwarding callback into the shared [`ModelRouter`]; the callback
//! captures only a `Weak` reference back to the manager, so the router
//! never keeps a dead manager alive.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use manifold_core::protocol::{
    decode_frame, encode_frame, ErrorPayload, ForwardRequestPayload, ForwardResponsePayload,
    Frame, FrameType, HandshakeAckPayload, HandshakePayload, HeartbeatPayload, ModelType,
    RegisterAckPayload, RegisterModelPayload,
};
use manifold_core::{ModelRouter, OutputEvent, Provider};

use crate::cluster::local_ipv4;

/// Send timeout for a master → worker forward; generations can be slow.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

/// One live worker as seen by the master.
#[derive(Debug)]
struct WorkerConnection {
    host: String,
    port: u16,
    last_heartbeat: Instant,
    models: HashSet<String>,
}

/// One in-flight forwarded request awaiting its FORWARD_RESPONSE.
struct PendingRequest {
    provider: Arc<Provider>,
    started: Instant,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<String, WorkerConnection>,
    model_to_worker: HashMap<String, String>,
    pending: HashMap<String, PendingRequest>,
}

/// Master-side registry of workers, their models, and pending forwards.
pub struct WorkerManager {
    router: Arc<ModelRouter>,
    state: Mutex<ManagerState>,
    http: reqwest::Client,
    next_request_id: AtomicU64,
    /// How long a silent worker survives before being pruned.
    worker_timeout: Duration,
    /// Sweep cadence for dead workers and stale pending entries.
    sweep_interval: Duration,
    /// Control-plane bind address, known once [`Self::serve`] has a
    /// listener; advertised to workers in the HANDSHAKE_ACK.
    control_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerManager {
    pub fn new(router: Arc<ModelRouter>) -> Arc<Self> {
        Self::with_intervals(router, Duration::from_secs(30), Duration::from_secs(5))
    }

    /// Custom prune threshold and sweep cadence (tests use short ones).
    pub fn with_intervals(
        router: Arc<ModelRouter>,
        worker_timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            router,
            state: Mutex::new(ManagerState::default()),
            http: reqwest::Client::new(),
            next_request_id: AtomicU64::new(1),
            worker_timeout,
            sweep_interval,
            control_addr: Mutex::new(None),
            shutdown,
        })
    }

    /// The control-plane router (`/internal/*`), all frame-based.
    pub fn internal_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/internal/handshake", post(handle_handshake))
            .route("/internal/register", post(handle_register))
            .route("/internal/heartbeat", post(handle_heartbeat))
            .route("/internal/response", post(handle_response))
            .route("/internal/disconnect", post(handle_disconnect))
            .with_state(Arc::clone(self))
    }

    /// Serve the control plane on `listener` and start the sweeper.
    /// Returns once the routes are being served (the tasks run detached).
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        *self.control_addr.lock().unwrap() = listener.local_addr().ok();
        let app = self
            .internal_router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "control-plane listener exited");
            }
        });

        let sweeper = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweeper.sweep_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => sweeper.sweep(),
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    // ── Worker registry ───────────────────────────────────────────────────

    /// Record (or re-record) a worker from its handshake.
    pub fn register_worker(&self, worker_id: &str, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.workers.insert(
            worker_id.to_owned(),
            WorkerConnection {
                host: host.to_owned(),
                port,
                last_heartbeat: Instant::now(),
                models: HashSet::new(),
            },
        );
        info!(worker_id, host, port, "worker registered");
    }

    /// Drop a worker and every model it owned.
    pub fn unregister_worker(&self, worker_id: &str) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.workers.remove(worker_id) else {
                return;
            };
            for model in &conn.models {
                state.model_to_worker.remove(model);
            }
            conn.models
        };
        for model in &removed {
            self.router.unregister_all(model);
        }
        info!(worker_id, models = removed.len(), "worker unregistered");
    }

    /// Arbitrate a model registration.  The name must be globally unique:
    /// unknown to other workers *and* to the master's local registry.
    pub fn register_model(
        self: &Arc<Self>,
        worker_id: &str,
        model_type: ModelType,
        model_name: &str,
    ) -> Result<(), String> {
        {
            let mut state = self.state.lock().unwrap();
            if state.model_to_worker.contains_key(model_name) {
                return Err(format!("Model name already exists: {model_name}"));
            }
            if self.router.has_any(model_name) {
                return Err(format!(
                    "Model name conflicts with a local model: {model_name}"
                ));
            }
            let Some(conn) = state.workers.get_mut(worker_id) else {
                return Err(format!("Unknown worker: {worker_id}"));
            };
            conn.models.insert(model_name.to_owned());
            state
                .model_to_worker
                .insert(model_name.to_owned(), worker_id.to_owned());
        }
        self.install_forwarder(model_type, model_name);
        info!(worker_id, model = model_name, ?model_type, "worker model registered");
        Ok(())
    }

    pub fn has_model(&self, model_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .model_to_worker
            .contains_key(model_name)
    }

    pub fn worker_for_model(&self, model_name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .model_to_worker
            .get(model_name)
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    /// The master address workers should record, resolved from the
    /// control listener.  A wildcard bind is advertised as the first
    /// non-loopback IPv4, same as on the worker side.
    fn advertised_addr(&self) -> (String, u16) {
        match *self.control_addr.lock().unwrap() {
            Some(addr) if !addr.ip().is_unspecified() => (addr.ip().to_string(), addr.port()),
            Some(addr) => (local_ipv4(), addr.port()),
            None => (local_ipv4(), 0),
        }
    }

    // ── Forwarding ────────────────────────────────────────────────────────

    /// Forward one request to the worker owning `model_name`, wiring the
    /// eventual FORWARD_RESPONSE back into `provider`.  On any failure an
    /// error event is pushed and `false` returned; the caller decides
    /// whether to also end the provider.
    pub fn forward_request(
        self: &Arc<Self>,
        model_name: &str,
        model_type: ModelType,
        request: Value,
        provider: Arc<Provider>,
    ) -> bool {
        // Snapshot the address under the lock; the network call happens
        // outside it.
        let target = {
            let state = self.state.lock().unwrap();
            state
                .model_to_worker
                .get(model_name)
                .and_then(|wid| state.workers.get(wid))
                .map(|conn| (conn.host.clone(), conn.port))
        };
        let Some((host, port)) = target else {
            provider.push(OutputEvent::error(
                "worker_not_found",
                format!("No live worker owns model '{model_name}'"),
            ));
            return false;
        };

        let request_id = format!(
            "req_{:016x}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed)
        );
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                request_id.clone(),
                PendingRequest {
                    provider,
                    started: Instant::now(),
                },
            );
        }

        debug!(model = model_name, %request_id, worker = %format!("{host}:{port}"), "forwarding request");

        let payload = ForwardRequestPayload {
            request_id: request_id.clone(),
            model_type: model_type.as_u32(),
            request,
        };
        let frame = encode_frame(FrameType::ForwardRequest, &payload);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let url = format!("http://{host}:{port}/internal/forward");
            let result = manager
                .http
                .post(&url)
                .header(CONTENT_TYPE.as_str(), "application/octet-stream")
                .timeout(FORWARD_TIMEOUT)
                .body(frame)
                .send()
                .await;

            let failed = match result {
                Ok(resp) => !resp.status().is_success(),
                Err(_) => true,
            };
            if failed {
                let error = ErrorPayload {
                    error_code: "forward_failed".into(),
                    error_message: format!("Failed to forward request to {host}:{port}"),
                };
                manager.handle_worker_response(
                    &request_id,
                    serde_json::to_value(error).unwrap_or_default(),
                    true,
                );
            }
        });

        true
    }

    /// Correlate a FORWARD_RESPONSE to its provider and drive it to
    /// completion.  Unknown or duplicate ids are dropped silently.
    pub fn handle_worker_response(&self, request_id: &str, response: Value, is_error: bool) {
        let Some(pending) = self.state.lock().unwrap().pending.remove(request_id) else {
            debug!(%request_id, "response for unknown request dropped");
            return;
        };
        let provider = pending.provider;

        if is_error {
            let code = response
                .get("error_code")
                .and_then(Value::as_str)
                .unwrap_or("worker_error");
            let message = response
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            provider.push(OutputEvent::error(code, message));
            provider.end();
            return;
        }

        if let Some(chunks) = response.get("chunks").and_then(Value::as_array) {
            for chunk in chunks {
                if let Some(ev) = event_from_chunk(chunk) {
                    provider.push(ev);
                }
            }
        } else if let Some(ev) = event_from_chunk(&response) {
            provider.push(ev);
        }
        provider.end();
    }

    // ── Liveness ──────────────────────────────────────────────────────────

    /// Refresh a worker's heartbeat, tracking address changes.
    pub fn heartbeat(&self, worker_id: &str, host: &str, port: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(conn) = state.workers.get_mut(worker_id) else {
            return false;
        };
        conn.last_heartbeat = Instant::now();
        if !host.is_empty() {
            conn.host = host.to_owned();
        }
        if port > 0 {
            conn.port = port;
        }
        true
    }

    /// Prune workers that stopped heartbeating and pending entries whose
    /// transport has certainly given up.
    fn sweep(self: &Arc<Self>) {
        let dead: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .workers
                .iter()
                .filter(|(_, conn)| conn.last_heartbeat.elapsed() > self.worker_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for worker_id in dead {
            warn!(worker_id = %worker_id, "pruning dead worker");
            self.unregister_worker(&worker_id);
        }

        let mut state = self.state.lock().unwrap();
        state
            .pending
            .retain(|_, pending| pending.started.elapsed() <= FORWARD_TIMEOUT);
    }

    // ── Forwarder installation ────────────────────────────────────────────

    /// Register a router callback that forwards to whichever worker owns
    /// the model at call time.
    fn install_forwarder(self: &Arc<Self>, model_type: ModelType, model_name: &str) {
        let weak = Arc::downgrade(self);
        let name = model_name.to_owned();
        match model_type {
            ModelType::Chat => {
                self.router.register_chat(
                    model_name,
                    Arc::new(move |req: &manifold_core::ChatRequest, provider| {
                        forward_via(&weak, &name, ModelType::Chat, req.raw.clone(), provider);
                    }),
                );
            }
            ModelType::Embedding => {
                self.router.register_embedding(
                    model_name,
                    Arc::new(move |req: &manifold_core::EmbeddingRequest, provider| {
                        forward_via(&weak, &name, ModelType::Embedding, req.raw.clone(), provider);
                    }),
                );
            }
            ModelType::Asr => {
                self.router.register_asr(
                    model_name,
                    Arc::new(move |req: &manifold_core::AsrRequest, provider| {
                        // Multipart does not survive re-serialisation; the
                        // structured fields (audio included, as base64) do.
                        forward_via(&weak, &name, ModelType::Asr, req.to_forward_value(), provider);
                    }),
                );
            }
            ModelType::Tts => {
                self.router.register_tts(
                    model_name,
                    Arc::new(move |req: &manifold_core::TtsRequest, provider| {
                        forward_via(&weak, &name, ModelType::Tts, req.raw.clone(), provider);
                    }),
                );
            }
            ModelType::ImageGen => {
                self.router.register_image_gen(
                    model_name,
                    Arc::new(move |req: &manifold_core::ImageGenRequest, provider| {
                        forward_via(&weak, &name, ModelType::ImageGen, req.raw.clone(), provider);
                    }),
                );
            }
        }
    }
}

/// Forward through a possibly-gone manager; any failure terminates the
/// provider so unary waits and streams both finish promptly.
fn forward_via(
    manager: &Weak<WorkerManager>,
    model_name: &str,
    model_type: ModelType,
    request: Value,
    provider: Arc<Provider>,
) {
    let Some(manager) = manager.upgrade() else {
        provider.push(OutputEvent::error(
            "worker_not_found",
            "Cluster manager is shut down",
        ));
        provider.end();
        return;
    };
    if !manager.forward_request(model_name, model_type, request, Arc::clone(&provider)) {
        provider.end();
    }
}

/// Map one worker response chunk back into an event.
fn event_from_chunk(chunk: &Value) -> Option<OutputEvent> {
    if let Some(text) = chunk.get("text").and_then(Value::as_str) {
        let is_delta = chunk
            .get("is_delta")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_delta {
            return Some(OutputEvent::text_delta(text, ""));
        }
        let ev = match chunk.get("finish_reason").and_then(Value::as_str) {
            Some(reason) => OutputEvent::final_text_with_reason(text, reason, ""),
            None => OutputEvent::final_text(text, ""),
        };
        return Some(ev);
    }
    if let Some(embeddings) = chunk.get("embeddings") {
        let vectors: Vec<Vec<f32>> = serde_json::from_value(embeddings.clone()).ok()?;
        return Some(OutputEvent::batch_embeddings(vectors, ""));
    }
    if let Some(b64) = chunk.get("bytes_b64").and_then(Value::as_str) {
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
        let mime = chunk
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_owned();
        let ev = if mime.starts_with("image/") {
            OutputEvent::image(data, mime, "")
        } else {
            OutputEvent::audio(data, mime, "")
        };
        return Some(ev);
    }
    if let Some(json) = chunk.get("json") {
        return Some(OutputEvent::json(json.clone(), ""));
    }
    None
}

// ── Frame endpoint handlers ────────────────────────────────────────────────────

fn frame_response<P: serde::Serialize>(frame_type: FrameType, payload: &P) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        encode_frame(frame_type, payload),
    )
        .into_response()
}

fn decode_or_400(body: &Bytes, expected: FrameType) -> Result<Frame, Response> {
    let frame = decode_frame(body).map_err(|e| {
        debug!(error = %e, "rejecting malformed frame");
        StatusCode::BAD_REQUEST.into_response()
    })?;
    if frame.frame_type != expected {
        return Err(StatusCode::BAD_REQUEST.into_response());
    }
    Ok(frame)
}

async fn handle_handshake(
    State(manager): State<Arc<WorkerManager>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let frame = match decode_or_400(&body, FrameType::Handshake) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let Ok(payload) = frame.payload_as::<HandshakePayload>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if payload.worker_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    // The auto-mode probe handshakes to identify the service but is not a
    // worker; acknowledge without registering it.
    if payload.worker_id != "probe" {
        let host = if payload.worker_host.is_empty() {
            remote.ip().to_string()
        } else {
            payload.worker_host.clone()
        };
        manager.register_worker(&payload.worker_id, &host, payload.worker_port);
    }

    let (master_host, master_port) = manager.advertised_addr();
    frame_response(
        FrameType::HandshakeAck,
        &HandshakeAckPayload {
            accepted: true,
            message: "Welcome".into(),
            master_host,
            master_port,
        },
    )
}

async fn handle_register(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let frame = match decode_or_400(&body, FrameType::RegisterModel) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let Ok(payload) = frame.payload_as::<RegisterModelPayload>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if payload.worker_id.is_empty() || payload.model_name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Ok(model_type) = ModelType::try_from(payload.model_type) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // A registration may carry a fresher address than the handshake did
    // (the worker's endpoint port is only final once bound).
    {
        let mut state = manager.state.lock().unwrap();
        if let Some(conn) = state.workers.get_mut(&payload.worker_id) {
            if !payload.worker_host.is_empty() {
                conn.host = payload.worker_host.clone();
            }
            if payload.worker_port > 0 {
                conn.port = payload.worker_port;
            }
        }
    }

    let ack = match manager.register_model(&payload.worker_id, model_type, &payload.model_name) {
        Ok(()) => RegisterAckPayload {
            success: true,
            message: String::new(),
        },
        Err(reason) => {
            warn!(model = %payload.model_name, %reason, "model registration rejected");
            RegisterAckPayload {
                success: false,
                message: reason,
            }
        }
    };
    frame_response(FrameType::RegisterAck, &ack)
}

async fn handle_heartbeat(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let frame = match decode_or_400(&body, FrameType::Heartbeat) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let Ok(payload) = frame.payload_as::<HeartbeatPayload>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    manager.heartbeat(&payload.worker_id, &payload.worker_host, payload.worker_port);
    frame_response(FrameType::HeartbeatAck, &serde_json::json!({"pong": true}))
}

async fn handle_response(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let frame = match decode_or_400(&body, FrameType::ForwardResponse) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let Ok(payload) = frame.payload_as::<ForwardResponsePayload>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    manager.handle_worker_response(&payload.request_id, payload.response, payload.is_error);
    (StatusCode::OK, "OK").into_response()
}

async fn handle_disconnect(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let frame = match decode_or_400(&body, FrameType::Disconnect) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    if let Some(worker_id) = frame.payload.get("worker_id").and_then(Value::as_str) {
        manager.unregister_worker(worker_id);
    }
    (StatusCode::OK, "OK").into_response()
}
