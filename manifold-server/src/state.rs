//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use manifold_core::ModelRouter;

use crate::admission::Admission;
use crate::config::GatewayConfig;

/// State shared across all HTTP handlers.
pub struct AppState {
    /// Gateway configuration (env-derived, CLI-overridden).
    pub config: GatewayConfig,
    /// Name → callback registry across all modalities, local and remote.
    pub router: Arc<ModelRouter>,
    /// Concurrency gate for every POST endpoint.
    pub admission: Admission,
}

impl AppState {
    pub fn new(config: GatewayConfig, router: Arc<ModelRouter>) -> Arc<Self> {
        let admission = Admission::new(config.max_concurrency);
        Arc::new(Self {
            config,
            router,
            admission,
        })
    }
}
