//! Model listing route.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models))]
pub struct ModelsApi;

/// Register the model-listing route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// OpenAI model listing (`GET /v1/models`).
///
/// Every registered name across all modalities, local and
/// worker-provided, deduplicated.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Registered models", body = Value)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created = Utc::now().timestamp();
    let data: Vec<Value> = state
        .router
        .list_all()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": state.config.owner,
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}
