//! The master/worker cluster fabric.
//!
//! A master runs the OpenAI frontend plus a control-plane listener on
//! `frontend_port + 1000`; workers connect there, register their models,
//! and receive forwarded requests on their own local endpoint.  All
//! control traffic is binary frames (see `manifold_core::protocol`)
//! carried as HTTP POST bodies on `/internal/*` paths.

pub mod manager;
pub mod node;
pub mod worker;

pub use manager::WorkerManager;
pub use node::{ClusterMode, ClusterNode};
pub use worker::{WorkerClient, WorkerOptions};

/// First non-loopback IPv4 of this host, used when a worker listens on a
/// wildcard address but must advertise something the master can reach.
/// The connect() here sends no packets; the OS just resolves the route.
pub(crate) fn local_ipv4() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_owned())
}
