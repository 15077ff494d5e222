use tower_http::cors::{Any, CorsLayer};

use crate::config::GatewayConfig;

/// CORS layer for the frontend; also answers preflight OPTIONS requests.
pub fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    if let Some(origins_str) = &config.cors_allowed_origins {
        // Parse the comma-separated origin list and build a restrictive layer.
        let origins: Vec<axum::http::HeaderValue> = origins_str
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if !origins.is_empty() {
            return CorsLayer::new()
                .allow_origin(origins)
                .allow_headers(Any)
                .allow_methods(Any);
        }
    }
    // Wildcard – suitable for development; set MANIFOLD_CORS_ORIGINS in
    // production.
    CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any)
}
