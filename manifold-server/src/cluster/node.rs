//! Auto-mode controller.
//!
//! One binary, two roles.  On startup the node tries to bind the frontend
//! port: success means it is first, so it becomes the master (frontend on
//! P, control plane on P+1000).  A bind failure means somebody is already
//! there – a probe handshake to the control port decides whether that
//! somebody is a manifold master (join it as a worker) or an unrelated
//! service (fail hard).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::header::CONTENT_TYPE;
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info};

use manifold_core::protocol::{decode_frame, encode_frame, FrameType, HandshakePayload};
use manifold_core::ModelRouter;

use crate::cluster::manager::WorkerManager;
use crate::cluster::worker::{WorkerClient, WorkerOptions};
use crate::config::GatewayConfig;
use crate::routes;
use crate::state::AppState;

/// Which role [`ClusterNode::run`] settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Master,
    Worker,
}

/// A gateway process that may become a master or a worker.
///
/// Register local models into [`ClusterNode::router`] before calling
/// [`ClusterNode::run`]: a master serves them directly, a worker offers
/// them to the master it joins.
pub struct ClusterNode {
    config: GatewayConfig,
    router: Arc<ModelRouter>,
    worker_options: WorkerOptions,
}

impl ClusterNode {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            router: Arc::new(ModelRouter::new()),
            worker_options: WorkerOptions::default(),
        }
    }

    /// The registry local models are staged in.
    pub fn router(&self) -> Arc<ModelRouter> {
        Arc::clone(&self.router)
    }

    /// Where this process listens for forwards if it becomes a worker.
    pub fn set_worker_listen(&mut self, host: &str, port: u16) {
        self.worker_options = WorkerOptions {
            listen_host: host.to_owned(),
            listen_port: port,
        };
    }

    /// Auto-detect the role and run until shutdown.
    pub async fn run(self) -> anyhow::Result<ClusterMode> {
        self.config
            .validate_cluster_port()
            .map_err(anyhow::Error::msg)?;
        let frontend_addr = format!("{}:{}", self.config.host, self.config.port);
        match TcpListener::bind(&frontend_addr).await {
            Ok(listener) => {
                info!(addr = %frontend_addr, "frontend port is free; starting as master");
                self.run_master(listener).await?;
                Ok(ClusterMode::Master)
            }
            Err(bind_err) => {
                let control_port = self.config.control_port();
                if probe_master("127.0.0.1", control_port).await {
                    info!(control_port, "found a running master; starting as worker");
                    self.run_worker("127.0.0.1", control_port).await?;
                    Ok(ClusterMode::Worker)
                } else {
                    error!(
                        addr = %frontend_addr,
                        "port is occupied by something that is not a manifold master"
                    );
                    Err(bind_err).context(format!(
                        "port {} is occupied and not a manifold master",
                        self.config.port
                    ))
                }
            }
        }
    }

    /// Run as master: control plane + frontend.  Blocks until ctrl-c.
    pub async fn run_master(self, frontend: TcpListener) -> anyhow::Result<()> {
        self.config
            .validate_cluster_port()
            .map_err(anyhow::Error::msg)?;
        let control_addr: SocketAddr =
            format!("{}:{}", self.config.host, self.config.control_port())
                .parse()
                .context("invalid control address")?;
        let control = TcpListener::bind(control_addr)
            .await
            .with_context(|| format!("failed to bind control port {}", control_addr.port()))?;

        let manager = WorkerManager::new(Arc::clone(&self.router));
        manager.serve(control);
        info!(control_port = control_addr.port(), "worker manager listening");

        let state = AppState::new(self.config.clone(), Arc::clone(&self.router));
        let app = routes::build(state);
        info!(
            port = self.config.port,
            max_concurrency = self.config.max_concurrency,
            models = %self.router.list_all().join(", "),
            "frontend listening"
        );

        let result = axum::serve(frontend, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        manager.stop();
        result.context("frontend server failed")
    }

    /// Run as worker against an existing master.  Blocks until the agent
    /// stops or ctrl-c.
    pub async fn run_worker(self, master_host: &str, control_port: u16) -> anyhow::Result<()> {
        let client = WorkerClient::connect(
            master_host,
            control_port,
            self.worker_options.clone(),
            Arc::clone(&self.router),
        )
        .await
        .with_context(|| format!("failed to connect to master at {master_host}:{control_port}"))?;

        tokio::select! {
            _ = client.closed() => {
                info!("worker agent stopped");
            }
            _ = shutdown_signal() => {
                info!("shutting down worker");
                client.disconnect().await;
            }
        }
        Ok(())
    }
}

/// Probe `host:port` with a throwaway handshake; `true` iff a well-formed
/// HANDSHAKE_ACK comes back – i.e. a manifold master lives there.
pub async fn probe_master(host: &str, port: u16) -> bool {
    let payload = HandshakePayload {
        worker_id: "probe".into(),
        worker_host: String::new(),
        worker_port: 0,
        timestamp: Utc::now().timestamp(),
    };
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    let response = client
        .post(format!("http://{host}:{port}/internal/handshake"))
        .header(CONTENT_TYPE.as_str(), "application/octet-stream")
        .body(encode_frame(FrameType::Handshake, &payload))
        .send()
        .await;
    let Ok(response) = response else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    let Ok(body) = response.bytes().await else {
        return false;
    };
    matches!(
        decode_frame(&body),
        Ok(frame) if frame.frame_type == FrameType::HandshakeAck
    )
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
