//! The model router: name → callback registries for the five modalities.
//!
//! Registration is rare (startup, worker connect); lookups and dispatches
//! are hot, so each registry sits behind its own read-write lock.  A
//! dispatch clones the callback `Arc` under the read lock, drops the lock,
//! and runs the callback on its own blocking task so HTTP handlers never
//! wait on model execution.  A panicking callback is caught at this
//! boundary and translated into an error event on the provider.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::event::OutputEvent;
use crate::provider::Provider;
use crate::types::{AsrRequest, ChatRequest, EmbeddingRequest, ImageGenRequest, TtsRequest};

/// The five request families a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Chat,
    Embedding,
    Asr,
    Tts,
    ImageGen,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Chat => "chat",
            Modality::Embedding => "embedding",
            Modality::Asr => "asr",
            Modality::Tts => "tts",
            Modality::ImageGen => "image-gen",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model implementation: synchronous, pushes events, ends the provider.
pub type ModelCallback<R> = Arc<dyn Fn(&R, Arc<Provider>) + Send + Sync>;

/// One modality's name → callback map.
struct Registry<R> {
    models: RwLock<HashMap<String, ModelCallback<R>>>,
}

impl<R: Send + Sync + 'static> Registry<R> {
    fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: &str, callback: ModelCallback<R>) {
        self.models
            .write()
            .unwrap()
            .insert(name.to_owned(), callback);
    }

    fn unregister(&self, name: &str) {
        self.models.write().unwrap().remove(name);
    }

    fn has(&self, name: &str) -> bool {
        self.models.read().unwrap().contains_key(name)
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up and dispatch.  Returns `false` when the name is unknown.
    fn route(&self, name: &str, request: R, provider: Arc<Provider>) -> bool {
        let callback = match self.models.read().unwrap().get(name) {
            Some(cb) => Arc::clone(cb),
            None => return false,
        };

        let model_name = name.to_owned();
        let worker_provider = Arc::clone(&provider);
        tokio::spawn(async move {
            let joined =
                tokio::task::spawn_blocking(move || callback(&request, worker_provider)).await;
            if let Err(e) = joined {
                // Only panics land here; a clean return already ended (or
                // deliberately left open) the provider.
                let message = panic_message(e);
                warn!(model = %model_name, error = %message, "model callback panicked");
                provider.push(OutputEvent::error("model_error", message));
                provider.end();
            }
        });
        true
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if e.is_panic() {
        let payload = e.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "model callback panicked".to_owned()
        }
    } else {
        "model callback was cancelled".to_owned()
    }
}

/// Routes requests to registered model callbacks across all modalities.
///
/// Names are unique per modality (re-registering overwrites); the same
/// name in two modalities is allowed and both appear once in
/// [`ModelRouter::list_all`].
pub struct ModelRouter {
    chat: Registry<ChatRequest>,
    embedding: Registry<EmbeddingRequest>,
    asr: Registry<AsrRequest>,
    tts: Registry<TtsRequest>,
    image_gen: Registry<ImageGenRequest>,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            chat: Registry::new(),
            embedding: Registry::new(),
            asr: Registry::new(),
            tts: Registry::new(),
            image_gen: Registry::new(),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    pub fn register_chat(&self, name: &str, callback: ModelCallback<ChatRequest>) {
        self.chat.register(name, callback);
    }

    pub fn register_embedding(&self, name: &str, callback: ModelCallback<EmbeddingRequest>) {
        self.embedding.register(name, callback);
    }

    pub fn register_asr(&self, name: &str, callback: ModelCallback<AsrRequest>) {
        self.asr.register(name, callback);
    }

    pub fn register_tts(&self, name: &str, callback: ModelCallback<TtsRequest>) {
        self.tts.register(name, callback);
    }

    pub fn register_image_gen(&self, name: &str, callback: ModelCallback<ImageGenRequest>) {
        self.image_gen.register(name, callback);
    }

    // ── Routing ───────────────────────────────────────────────────────────

    pub fn route_chat(&self, request: ChatRequest, provider: Arc<Provider>) -> bool {
        let name = request.model.clone();
        self.chat.route(&name, request, provider)
    }

    pub fn route_embedding(&self, request: EmbeddingRequest, provider: Arc<Provider>) -> bool {
        let name = request.model.clone();
        self.embedding.route(&name, request, provider)
    }

    pub fn route_asr(&self, request: AsrRequest, provider: Arc<Provider>) -> bool {
        let name = request.model.clone();
        self.asr.route(&name, request, provider)
    }

    pub fn route_tts(&self, request: TtsRequest, provider: Arc<Provider>) -> bool {
        let name = request.model.clone();
        self.tts.route(&name, request, provider)
    }

    pub fn route_image_gen(&self, request: ImageGenRequest, provider: Arc<Provider>) -> bool {
        let name = request.model.clone();
        self.image_gen.route(&name, request, provider)
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn has(&self, modality: Modality, name: &str) -> bool {
        match modality {
            Modality::Chat => self.chat.has(name),
            Modality::Embedding => self.embedding.has(name),
            Modality::Asr => self.asr.has(name),
            Modality::Tts => self.tts.has(name),
            Modality::ImageGen => self.image_gen.has(name),
        }
    }

    /// `true` if the name is registered under any modality.
    pub fn has_any(&self, name: &str) -> bool {
        self.chat.has(name)
            || self.embedding.has(name)
            || self.asr.has(name)
            || self.tts.has(name)
            || self.image_gen.has(name)
    }

    pub fn list(&self, modality: Modality) -> Vec<String> {
        match modality {
            Modality::Chat => self.chat.list(),
            Modality::Embedding => self.embedding.list(),
            Modality::Asr => self.asr.list(),
            Modality::Tts => self.tts.list(),
            Modality::ImageGen => self.image_gen.list(),
        }
    }

    /// Sorted, deduplicated union of every registered name (`/v1/models`).
    pub fn list_all(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        names.extend(self.chat.list());
        names.extend(self.embedding.list());
        names.extend(self.asr.list());
        names.extend(self.tts.list());
        names.extend(self.image_gen.list());
        names.into_iter().collect()
    }

    // ── Removal ───────────────────────────────────────────────────────────

    pub fn unregister(&self, modality: Modality, name: &str) {
        match modality {
            Modality::Chat => self.chat.unregister(name),
            Modality::Embedding => self.embedding.unregister(name),
            Modality::Asr => self.asr.unregister(name),
            Modality::Tts => self.tts.unregister(name),
            Modality::ImageGen => self.image_gen.unregister(name),
        }
    }

    /// Remove the name from every modality (worker teardown path).
    pub fn unregister_all(&self, name: &str) {
        self.chat.unregister(name);
        self.embedding.unregister(name);
        self.asr.unregister(name);
        self.tts.unregister(name);
        self.image_gen.unregister(name);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::OutputEvent;

    fn chat_request(model: &str) -> ChatRequest {
        ChatRequest::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .unwrap()
    }

    #[test]
    fn register_has_list() {
        let router = ModelRouter::new();
        router.register_chat("gpt-4", Arc::new(|_req, p| p.end()));
        router.register_chat("qwen", Arc::new(|_req, p| p.end()));
        router.register_asr("whisper-1", Arc::new(|_req, p| p.end()));

        assert!(router.has(Modality::Chat, "gpt-4"));
        assert!(!router.has(Modality::Embedding, "gpt-4"));
        assert!(router.has_any("whisper-1"));
        assert_eq!(router.list(Modality::Chat), ["gpt-4", "qwen"]);
    }

    #[test]
    fn list_all_deduplicates_across_modalities() {
        let router = ModelRouter::new();
        router.register_chat("omni", Arc::new(|_req, p| p.end()));
        router.register_asr("omni", Arc::new(|_req, p| p.end()));
        router.register_tts("speak", Arc::new(|_req, p| p.end()));
        assert_eq!(router.list_all(), ["omni", "speak"]);
    }

    #[test]
    fn unregister_removes_the_name() {
        let router = ModelRouter::new();
        router.register_chat("gone", Arc::new(|_req, p| p.end()));
        router.unregister(Modality::Chat, "gone");
        assert!(!router.has_any("gone"));
        // Removing again is a no-op.
        router.unregister(Modality::Chat, "gone");
    }

    #[tokio::test]
    async fn route_dispatches_and_events_arrive() {
        let router = ModelRouter::new();
        router.register_chat(
            "gpt-4",
            Arc::new(|req, p| {
                p.push(OutputEvent::final_text("Hello", &req.model));
                p.end();
            }),
        );

        let provider = Arc::new(Provider::new());
        assert!(router.route_chat(chat_request("gpt-4"), Arc::clone(&provider)));
        let ev = provider
            .wait_pop_for(Duration::from_secs(2))
            .await
            .expect("callback should push");
        assert_eq!(ev.text(), Some("Hello"));
        assert!(provider.wait_pop_for(Duration::from_secs(2)).await.is_none());
        assert!(provider.is_ended());
    }

    #[tokio::test]
    async fn route_unknown_model_returns_false() {
        let router = ModelRouter::new();
        let provider = Arc::new(Provider::new());
        assert!(!router.route_chat(chat_request("nope"), provider));
    }

    #[tokio::test]
    async fn panicking_callback_becomes_error_event() {
        let router = ModelRouter::new();
        router.register_chat("bomb", Arc::new(|_req, _p| panic!("kaboom")));

        let provider = Arc::new(Provider::new());
        assert!(router.route_chat(chat_request("bomb"), Arc::clone(&provider)));
        let ev = provider
            .wait_pop_for(Duration::from_secs(2))
            .await
            .expect("panic should surface as an event");
        assert!(ev.is_error());
        match ev.kind {
            crate::event::EventKind::Error { code, message } => {
                assert_eq!(code, "model_error");
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(provider.wait_pop_for(Duration::from_secs(2)).await.is_none());
    }

    #[tokio::test]
    async fn reregistering_overwrites_the_callback() {
        let router = ModelRouter::new();
        router.register_chat(
            "m",
            Arc::new(|_req, p| {
                p.push(OutputEvent::final_text("old", "m"));
                p.end();
            }),
        );
        router.register_chat(
            "m",
            Arc::new(|_req, p| {
                p.push(OutputEvent::final_text("new", "m"));
                p.end();
            }),
        );
        let provider = Arc::new(Provider::new());
        router.route_chat(chat_request("m"), Arc::clone(&provider));
        let ev = provider.wait_pop_for(Duration::from_secs(2)).await.unwrap();
        assert_eq!(ev.text(), Some("new"));
    }
}
