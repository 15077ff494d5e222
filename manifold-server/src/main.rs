//! manifold – standalone OpenAI-compatible frontend.
//!
//! Startup order:
//! 1. Parse CLI flags and environment configuration.
//! 2. Initialise structured tracing.
//! 3. Register the requested models (mock callbacks; real deployments
//!    embed the crate and register their own).
//! 4. Bind the frontend port and serve until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use manifold_core::ModelRouter;
use manifold_server::config::{init_tracing, GatewayConfig};
use manifold_server::{mock, routes, AppState};

/// OpenAI-compatible inference gateway.
#[derive(Debug, Parser)]
#[command(name = "manifold", version)]
struct Cli {
    /// Enable bearer authentication with this key.
    #[arg(long)]
    api_key: Option<String>,

    /// Comma-separated model names to register (modality by prefix).
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    /// Frontend port.
    port: Option<u16>,

    /// Maximum concurrent in-flight requests.
    max_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── 1. Configuration ──────────────────────────────────────────────────
    let mut cfg = GatewayConfig::from_env();
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(max) = cli.max_concurrency {
        cfg.max_concurrency = max;
    }
    if cli.api_key.is_some() {
        cfg.api_key = cli.api_key;
    }

    // ── 2. Tracing ────────────────────────────────────────────────────────
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "manifold starting");

    // ── 3. Models ─────────────────────────────────────────────────────────
    let router = Arc::new(ModelRouter::new());
    let models = if cli.models.is_empty() {
        vec![
            "gpt-4".to_owned(),
            "gpt-4o".to_owned(),
            "whisper-1".to_owned(),
            "text-embedding-ada-002".to_owned(),
        ]
    } else {
        cli.models
    };
    mock::register_models(&router, &models);

    // ── 4. HTTP server ────────────────────────────────────────────────────
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        max_concurrency = cfg.max_concurrency,
        auth = cfg.api_key.is_some(),
        models = %router.list_all().join(", "),
        "frontend listening"
    );

    let state = AppState::new(cfg, router);
    let app = routes::build(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server failed")?;

    Ok(())
}
