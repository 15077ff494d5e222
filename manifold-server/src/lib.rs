//! manifold-server – the HTTP surface of the manifold gateway.
//!
//! Serves the OpenAI-compatible frontend (chat completions, embeddings,
//! audio, images) and the cluster control plane: the master-side worker
//! manager, the worker-side agent, and the auto-mode node that decides
//! which of the two a process becomes.

pub mod admission;
pub mod cluster;
pub mod config;
pub mod error;
pub mod middleware;
pub mod mock;
pub mod multipart;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use state::AppState;
