//! OpenAPI document assembly.
//!
//! The gateway's API surface is the fixed OpenAI schema, so the document
//! is deliberately thin – enough for tooling to discover paths.  Served
//! raw at `/api-docs/openapi.json`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "manifold gateway",
        description = "OpenAI-compatible inference gateway"
    ),
    tags(
        (name = "health"),
        (name = "models"),
        (name = "chat"),
        (name = "embeddings"),
        (name = "audio"),
        (name = "images"),
    )
)]
struct ApiDoc;

/// The merged OpenAPI document for every mounted route group.
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.merge(super::health::HealthApi::openapi());
    doc.merge(super::v1::chat::ChatApi::openapi());
    doc.merge(super::v1::embeddings::EmbeddingsApi::openapi());
    doc.merge(super::v1::audio::AudioApi::openapi());
    doc.merge(super::v1::speech::SpeechApi::openapi());
    doc.merge(super::v1::images::ImagesApi::openapi());
    doc.merge(super::v1::models::ModelsApi::openapi());
    doc
}
