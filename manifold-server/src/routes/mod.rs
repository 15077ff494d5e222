//! Axum router construction.
//!
//! [`build`] assembles the complete frontend router:
//! - Middleware layers (CORS incl. OPTIONS preflight, bearer auth)
//! - Health route
//! - OpenAI-compatible `/v1` routes, also mounted at the root so clients
//!   configured without the `/v1` prefix keep working
//! - The OpenAPI document at `/api-docs/openapi.json`

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;

use crate::middleware::{auth, cors};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the frontend.
pub fn build(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        // The OpenAI SDKs default to a `/v1` base path but plenty of
        // clients are configured with a bare host; serve both.
        .merge(v1::router())
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(doc::openapi()) }),
        );

    api_router
        // CORS sits outermost so preflight OPTIONS never hits auth.
        .layer(
            ServiceBuilder::new()
                .layer(cors::cors_layer(&state.config))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::auth_middleware,
                )),
        )
        .with_state(state)
}
