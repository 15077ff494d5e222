//! manifold-worker – cluster worker node.
//!
//! Connects to a running master, registers its models, and serves
//! forwarded requests on a local endpoint until the master goes away or
//! ctrl-c.  Supports cross-machine deployment via `--listen` for
//! multi-homed hosts and NAT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use manifold_core::OutputEvent;
use manifold_server::cluster::ClusterNode;
use manifold_server::config::{init_tracing, GatewayConfig, CONTROL_PORT_OFFSET, MAX_CLUSTER_PORT};

/// Cluster worker for the manifold gateway.
#[derive(Debug, Parser)]
#[command(name = "manifold-worker", version)]
struct Cli {
    /// Worker name; its demo model registers as `<name>-model`.
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Forward-endpoint listen address as HOST:PORT or a bare PORT
    /// (default: all interfaces, auto-assigned port).
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Master frontend host.
    #[arg(default_value = "127.0.0.1")]
    master_host: String,

    /// Master frontend port (control plane assumed on port + 1000, so
    /// the port must leave room for that offset).
    #[arg(default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..=MAX_CLUSTER_PORT as i64))]
    master_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = GatewayConfig::from_env();
    init_tracing(&cfg);

    let worker_name = cli
        .name
        .unwrap_or_else(|| format!("worker-{}", std::process::id() % 1000));
    // The clap range already rejects oversized ports; derive without any
    // chance of wrapping regardless.
    let control_port = cli
        .master_port
        .checked_add(CONTROL_PORT_OFFSET)
        .context("master port too high: the control port (master port + 1000) must fit in a u16")?;
    info!(
        worker = %worker_name,
        master = %format!("{}:{}", cli.master_host, cli.master_port),
        control_port,
        "starting cluster worker"
    );

    let mut node = ClusterNode::new(cfg);
    if let Some(listen) = &cli.listen {
        let (host, port) = parse_listen(listen)?;
        node.set_worker_listen(&host, port);
    }

    let model_name = format!("{worker_name}-model");
    let greeting = format!("Hello from {worker_name}!");
    node.router().register_chat(
        &model_name,
        Arc::new(move |req, provider| {
            for token in greeting.split_inclusive(' ') {
                provider.push(OutputEvent::text_delta(token, &req.model));
                std::thread::sleep(Duration::from_millis(100));
            }
            provider.push(OutputEvent::final_text(&greeting, &req.model));
            provider.end();
        }),
    );
    info!(model = %model_name, "registering worker model");

    node.run_worker(&cli.master_host, control_port).await
}

/// `HOST:PORT` or bare `PORT`.
fn parse_listen(listen: &str) -> anyhow::Result<(String, u16)> {
    match listen.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_owned(), port.parse()?)),
        None => Ok(("0.0.0.0".to_owned(), listen.parse()?)),
    }
}
