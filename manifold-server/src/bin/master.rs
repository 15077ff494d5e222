//! manifold-master – cluster master node.
//!
//! First process up: serves the OpenAI frontend on the given port and the
//! cluster control plane on port + 1000.  Workers started afterwards on
//! the same port join automatically and contribute their models.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use manifold_core::OutputEvent;
use manifold_server::cluster::ClusterNode;
use manifold_server::config::{init_tracing, GatewayConfig, MAX_CLUSTER_PORT};

/// Cluster master for the manifold gateway.
#[derive(Debug, Parser)]
#[command(name = "manifold-master", version)]
struct Cli {
    /// Frontend port (control plane on port + 1000, so the port must
    /// leave room for that offset).
    #[arg(default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..=MAX_CLUSTER_PORT as i64))]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = GatewayConfig::from_env();
    cfg.port = cli.port;
    init_tracing(&cfg);
    info!(port = cfg.port, control_port = cfg.control_port(), "starting cluster master");

    let node = ClusterNode::new(cfg.clone());

    // The master carries a local model of its own, so the cluster answers
    // something even before the first worker joins.
    node.router().register_chat(
        "master-model",
        Arc::new(|req, provider| {
            for token in ["Hello", " from", " master", "!"] {
                provider.push(OutputEvent::text_delta(token, &req.model));
                std::thread::sleep(Duration::from_millis(100));
            }
            provider.push(OutputEvent::final_text("Hello from master!", &req.model));
            provider.end();
        }),
    );

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    node.run_master(listener).await
}
