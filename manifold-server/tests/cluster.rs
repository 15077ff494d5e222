//! Cluster integration tests: control-plane frame handling, registration
//! arbitration, and the full master → worker → master forward loop over
//! real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceExt;

use manifold_core::protocol::{
    decode_frame, encode_frame, FrameType, HandshakeAckPayload, HandshakePayload, ModelType,
    RegisterAckPayload, RegisterModelPayload,
};
use manifold_core::{Modality, ModelRouter, OutputEvent, Provider};
use manifold_server::cluster::{WorkerClient, WorkerManager, WorkerOptions};
use manifold_server::{routes, AppState, GatewayConfig};

fn frame_request(path: &str, body: bytes::Bytes) -> Request<Body> {
    let mut request = Request::post(path)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(body))
        .unwrap();
    // internal_router is served with connect info; oneshot tests inject it.
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    request
}

fn handshake_frame(worker_id: &str, port: u16) -> bytes::Bytes {
    encode_frame(
        FrameType::Handshake,
        &HandshakePayload {
            worker_id: worker_id.into(),
            worker_host: "127.0.0.1".into(),
            worker_port: port,
            timestamp: 0,
        },
    )
}

fn register_frame(worker_id: &str, model_type: ModelType, model_name: &str) -> bytes::Bytes {
    encode_frame(
        FrameType::RegisterModel,
        &RegisterModelPayload {
            worker_id: worker_id.into(),
            worker_host: "127.0.0.1".into(),
            worker_port: 29999,
            model_type: model_type.as_u32(),
            model_name: model_name.into(),
        },
    )
}

async fn response_frame(response: axum::response::Response) -> manifold_core::protocol::Frame {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    decode_frame(&bytes).unwrap()
}

// ── Frame handlers ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_registers_the_worker_and_acks() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));
    let app = manager.internal_router();

    let response = app
        .oneshot(frame_request(
            "/internal/handshake",
            handshake_frame("worker_11aa22bb", 28080),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frame = response_frame(response).await;
    assert_eq!(frame.frame_type, FrameType::HandshakeAck);
    let ack: HandshakeAckPayload = frame.payload_as().unwrap();
    assert!(ack.accepted);
    assert!(
        !ack.master_host.is_empty(),
        "ack must advertise a master address"
    );
    assert_eq!(manager.worker_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_ack_advertises_the_control_address() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_port = listener.local_addr().unwrap().port();
    manager.serve(listener);

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{control_port}/internal/handshake"))
        .header(header::CONTENT_TYPE.as_str(), "application/octet-stream")
        .body(handshake_frame("worker_addrcheck", 28080))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body = response.bytes().await.unwrap();
    let frame = decode_frame(&body).unwrap();
    assert_eq!(frame.frame_type, FrameType::HandshakeAck);
    let ack: HandshakeAckPayload = frame.payload_as().unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.master_host, "127.0.0.1");
    assert_eq!(ack.master_port, control_port);
    manager.stop();
}

#[tokio::test]
async fn probe_handshake_is_acked_but_not_registered() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));
    let app = manager.internal_router();

    let response = app
        .oneshot(frame_request(
            "/internal/handshake",
            handshake_frame("probe", 0),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let frame = response_frame(response).await;
    assert_eq!(frame.frame_type, FrameType::HandshakeAck);
    assert_eq!(manager.worker_count(), 0);
}

#[tokio::test]
async fn malformed_frames_are_rejected_without_state_change() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));

    // Garbage body.
    let response = manager
        .internal_router()
        .oneshot(frame_request(
            "/internal/handshake",
            bytes::Bytes::from_static(b"not a frame"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Right header, wrong type for the endpoint.
    let response = manager
        .internal_router()
        .oneshot(frame_request(
            "/internal/register",
            handshake_frame("worker_x", 1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(manager.worker_count(), 0);
}

#[tokio::test]
async fn model_registration_arbitration() {
    let router = Arc::new(ModelRouter::new());
    // The master serves "shared" locally.
    router.register_chat("shared", Arc::new(|_req, p| p.end()));
    let manager = WorkerManager::new(Arc::clone(&router));

    let app = manager.internal_router();
    let response = app
        .clone()
        .oneshot(frame_request(
            "/internal/handshake",
            handshake_frame("worker_a", 28080),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Colliding with the local model is rejected.
    let response = app
        .clone()
        .oneshot(frame_request(
            "/internal/register",
            register_frame("worker_a", ModelType::Chat, "shared"),
        ))
        .await
        .unwrap();
    let ack: RegisterAckPayload = response_frame(response).await.payload_as().unwrap();
    assert!(!ack.success);
    assert!(ack.message.contains("shared"));
    assert!(!manager.has_model("shared"));
    // Exactly one "shared" remains, served locally.
    assert_eq!(
        router.list_all().iter().filter(|m| *m == "shared").count(),
        1
    );

    // A fresh name is accepted and mapped to the worker.
    let response = app
        .clone()
        .oneshot(frame_request(
            "/internal/register",
            register_frame("worker_a", ModelType::Chat, "worker-only"),
        ))
        .await
        .unwrap();
    let ack: RegisterAckPayload = response_frame(response).await.payload_as().unwrap();
    assert!(ack.success, "{}", ack.message);
    assert_eq!(manager.worker_for_model("worker-only").as_deref(), Some("worker_a"));
    assert!(router.has(Modality::Chat, "worker-only"));

    // A second worker cannot take the same name.
    let response = app
        .clone()
        .oneshot(frame_request(
            "/internal/handshake",
            handshake_frame("worker_b", 28081),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(frame_request(
            "/internal/register",
            register_frame("worker_b", ModelType::Chat, "worker-only"),
        ))
        .await
        .unwrap();
    let ack: RegisterAckPayload = response_frame(response).await.payload_as().unwrap();
    assert!(!ack.success);
    assert_eq!(manager.worker_for_model("worker-only").as_deref(), Some("worker_a"));
}

#[tokio::test]
async fn registration_for_an_unknown_worker_fails() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));
    let response = manager
        .internal_router()
        .oneshot(frame_request(
            "/internal/register",
            register_frame("worker_ghost", ModelType::Chat, "phantom"),
        ))
        .await
        .unwrap();
    let ack: RegisterAckPayload = response_frame(response).await.payload_as().unwrap();
    assert!(!ack.success);
    assert!(!manager.has_model("phantom"));
}

// ── Forward failure path ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_worker_surfaces_forward_failed() {
    let router = Arc::new(ModelRouter::new());
    let manager = WorkerManager::new(Arc::clone(&router));

    // A worker whose endpoint nobody listens on.
    manager.register_worker("worker_dead", "127.0.0.1", 1);
    manager
        .register_model("worker_dead", ModelType::Chat, "dead-model")
        .unwrap();

    let provider = Arc::new(Provider::new());
    let routed = manager.forward_request(
        "dead-model",
        ModelType::Chat,
        json!({"model": "dead-model"}),
        Arc::clone(&provider),
    );
    assert!(routed);

    let event = provider
        .wait_pop_for(Duration::from_secs(10))
        .await
        .expect("transport failure should synthesise an error event");
    assert!(event.is_error());
    match event.kind {
        manifold_core::EventKind::Error { code, .. } => assert_eq!(code, "forward_failed"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(provider.wait_pop_for(Duration::from_secs(2)).await.is_none());
    assert!(provider.is_ended());
}

#[tokio::test]
async fn late_responses_are_dropped_silently() {
    let manager = WorkerManager::new(Arc::new(ModelRouter::new()));
    // No pending entry for this id; must be a no-op.
    manager.handle_worker_response("req_unknown", json!({"text": "late"}), false);
}

// ── Dead-worker pruning ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn silent_workers_are_pruned_with_their_models() {
    let router = Arc::new(ModelRouter::new());
    let manager = WorkerManager::with_intervals(
        Arc::clone(&router),
        Duration::from_millis(200),
        Duration::from_millis(50),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    manager.serve(listener);

    manager.register_worker("worker_quiet", "127.0.0.1", 28080);
    manager
        .register_model("worker_quiet", ModelType::Chat, "quiet-model")
        .unwrap();
    assert!(router.has(Modality::Chat, "quiet-model"));

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(manager.worker_count(), 0);
    assert!(!manager.has_model("quiet-model"));
    assert!(!router.has(Modality::Chat, "quiet-model"));
    manager.stop();
}

// ── End-to-end forwarding (master ⇄ worker over real sockets) ──────────────────

async fn start_manager(router: Arc<ModelRouter>) -> (Arc<WorkerManager>, u16) {
    let manager = WorkerManager::new(router);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_port = listener.local_addr().unwrap().port();
    manager.serve(listener);
    (manager, control_port)
}

fn loopback_worker_options() -> WorkerOptions {
    WorkerOptions {
        listen_host: "127.0.0.1".to_owned(),
        listen_port: 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_model_is_served_through_the_master_frontend() {
    let master_router = Arc::new(ModelRouter::new());
    let (manager, control_port) = start_manager(Arc::clone(&master_router)).await;

    let worker_router = Arc::new(ModelRouter::new());
    worker_router.register_chat(
        "worker-chat",
        Arc::new(|req, provider| {
            provider.push(OutputEvent::final_text("Worker says hi", &req.model));
            provider.end();
        }),
    );
    let worker = WorkerClient::connect(
        "127.0.0.1",
        control_port,
        loopback_worker_options(),
        worker_router,
    )
    .await
    .expect("worker should connect");

    // Registration happened during connect; the master lists the model.
    assert!(manager.has_model("worker-chat"));
    assert!(master_router.has(Modality::Chat, "worker-chat"));

    let config = GatewayConfig {
        default_timeout_ms: 10_000,
        ..GatewayConfig::default()
    };
    let app = routes::build(AppState::new(config, Arc::clone(&master_router)));

    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"worker-chat"));

    let request = Request::post("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "model": "worker-chat",
                "messages": [{"role": "user", "content": "Hi"}],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Worker says hi");

    worker.disconnect().await;
    manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn streamed_worker_chunks_arrive_in_order() {
    let master_router = Arc::new(ModelRouter::new());
    let (manager, control_port) = start_manager(Arc::clone(&master_router)).await;

    let worker_router = Arc::new(ModelRouter::new());
    worker_router.register_chat(
        "stream-chat",
        Arc::new(|req, provider| {
            provider.push(OutputEvent::text_delta("one ", &req.model));
            provider.push(OutputEvent::text_delta("two ", &req.model));
            provider.push(OutputEvent::final_text_with_reason("", "stop", &req.model));
            provider.end();
        }),
    );
    let worker = WorkerClient::connect(
        "127.0.0.1",
        control_port,
        loopback_worker_options(),
        worker_router,
    )
    .await
    .unwrap();

    let provider = Arc::new(Provider::new());
    assert!(manager.forward_request(
        "stream-chat",
        ModelType::Chat,
        json!({"model": "stream-chat"}),
        Arc::clone(&provider),
    ));

    let mut deltas = String::new();
    let mut saw_final = false;
    while let Some(event) = provider.wait_pop_for(Duration::from_secs(10)).await {
        match &event.kind {
            manifold_core::EventKind::TextDelta { text } => deltas.push_str(text),
            manifold_core::EventKind::FinalText { finish_reason, .. } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                saw_final = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(deltas, "one two ");
    assert!(saw_final);
    assert!(provider.is_ended());

    worker.disconnect().await;
    manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_side_error_reaches_the_master_provider() {
    let master_router = Arc::new(ModelRouter::new());
    let (manager, control_port) = start_manager(Arc::clone(&master_router)).await;

    let worker_router = Arc::new(ModelRouter::new());
    worker_router.register_chat(
        "faulty",
        Arc::new(|_req, provider| {
            provider.push(OutputEvent::error("model_error", "engine exploded"));
            provider.end();
        }),
    );
    let worker = WorkerClient::connect(
        "127.0.0.1",
        control_port,
        loopback_worker_options(),
        worker_router,
    )
    .await
    .unwrap();

    let provider = Arc::new(Provider::new());
    assert!(manager.forward_request(
        "faulty",
        ModelType::Chat,
        json!({"model": "faulty"}),
        Arc::clone(&provider),
    ));

    let event = provider.wait_pop_for(Duration::from_secs(10)).await.unwrap();
    match event.kind {
        manifold_core::EventKind::Error { code, message } => {
            assert_eq!(code, "model_error");
            assert_eq!(message, "engine exploded");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(provider.wait_pop_for(Duration::from_secs(2)).await.is_none());

    worker.disconnect().await;
    manager.stop();
}
