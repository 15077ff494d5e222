//! Semantic output events.
//!
//! Model callbacks never see HTTP, JSON framing, or SSE; they emit
//! [`OutputEvent`]s and the encoder layer turns those into whatever the
//! wire needs.  Events are immutable after construction – build them with
//! the factory constructors.

use bytes::Bytes;
use chrono::Utc;

/// The payload of an [`OutputEvent`], tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A streamed text fragment from an LLM/VLM.
    TextDelta { text: String },
    /// The final complete text.  `finish_reason` defaults to `"stop"` at
    /// encode time when absent.
    FinalText {
        text: String,
        finish_reason: Option<String>,
    },
    /// A single embedding vector.
    Embedding { vector: Vec<f32> },
    /// A batch of embedding vectors, one per input.
    Embeddings { vectors: Vec<Vec<f32>> },
    /// An arbitrary JSON object, passed through verbatim by encoders that
    /// support it (e.g. URL-style image responses).
    Json { value: serde_json::Value },
    /// Synthesised audio.
    AudioBytes { data: Bytes, mime: String },
    /// A generated image.
    ImageBytes { data: Bytes, mime: String },
    /// A model-level error surfaced to the client.
    Error { code: String, message: String },
    /// End-of-stream marker.
    End,
}

/// One semantic output event plus the metadata encoders need to produce
/// OpenAI-shaped responses.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub kind: EventKind,
    /// Model that produced the event; encoders fall back to a placeholder
    /// when empty.
    pub model: String,
    /// Response id (`chatcmpl-…`); generated at encode time when empty.
    pub id: String,
    /// Unix timestamp stamped by the factory.
    pub created: i64,
    /// Index within a batch result.
    pub index: u32,
}

impl OutputEvent {
    fn with_kind(kind: EventKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            id: String::new(),
            created: Utc::now().timestamp(),
            index: 0,
        }
    }

    /// A streamed text fragment.
    pub fn text_delta(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_kind(EventKind::TextDelta { text: text.into() }, model)
    }

    /// The final complete text of a generation.
    pub fn final_text(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_kind(
            EventKind::FinalText {
                text: text.into(),
                finish_reason: None,
            },
            model,
        )
    }

    /// Final text with an explicit finish reason (`"stop"`, `"length"`, …).
    pub fn final_text_with_reason(
        text: impl Into<String>,
        reason: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            EventKind::FinalText {
                text: text.into(),
                finish_reason: Some(reason.into()),
            },
            model,
        )
    }

    /// A single embedding vector at the given batch index.
    pub fn single_embedding(vector: Vec<f32>, model: impl Into<String>, index: u32) -> Self {
        let mut ev = Self::with_kind(EventKind::Embedding { vector }, model);
        ev.index = index;
        ev
    }

    /// A batch of embedding vectors.
    pub fn batch_embeddings(vectors: Vec<Vec<f32>>, model: impl Into<String>) -> Self {
        Self::with_kind(EventKind::Embeddings { vectors }, model)
    }

    /// An arbitrary JSON object.
    pub fn json(value: serde_json::Value, model: impl Into<String>) -> Self {
        Self::with_kind(EventKind::Json { value }, model)
    }

    /// Synthesised audio bytes with their mime type (e.g. `"audio/mpeg"`).
    pub fn audio(data: impl Into<Bytes>, mime: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_kind(
            EventKind::AudioBytes {
                data: data.into(),
                mime: mime.into(),
            },
            model,
        )
    }

    /// Generated image bytes with their mime type (e.g. `"image/png"`).
    pub fn image(data: impl Into<Bytes>, mime: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_kind(
            EventKind::ImageBytes {
                data: data.into(),
                mime: mime.into(),
            },
            model,
        )
    }

    /// A model-level error (`code` is an OpenAI-style error type string).
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(
            EventKind::Error {
                code: code.into(),
                message: message.into(),
            },
            "",
        )
    }

    /// End-of-stream marker.
    pub fn end() -> Self {
        Self::with_kind(EventKind::End, "")
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, EventKind::End)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, EventKind::Error { .. })
    }

    /// The text carried by this event, if any.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::TextDelta { text } | EventKind::FinalText { text, .. } => Some(text),
            _ => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factories_set_kind_and_model() {
        let ev = OutputEvent::text_delta("Hel", "gpt-4");
        assert_eq!(ev.kind, EventKind::TextDelta { text: "Hel".into() });
        assert_eq!(ev.model, "gpt-4");
        assert!(ev.created > 0);
        assert!(!ev.is_end());
        assert!(!ev.is_error());
    }

    #[test]
    fn end_and_error_predicates() {
        assert!(OutputEvent::end().is_end());
        let err = OutputEvent::error("model_error", "boom");
        assert!(err.is_error());
        assert!(!err.is_end());
    }

    #[test]
    fn final_text_carries_finish_reason() {
        let ev = OutputEvent::final_text_with_reason("done", "length", "m");
        match ev.kind {
            EventKind::FinalText { finish_reason, .. } => {
                assert_eq!(finish_reason.as_deref(), Some("length"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn text_accessor_covers_both_text_kinds() {
        assert_eq!(OutputEvent::text_delta("a", "m").text(), Some("a"));
        assert_eq!(OutputEvent::final_text("b", "m").text(), Some("b"));
        assert_eq!(OutputEvent::end().text(), None);
    }

    #[test]
    fn single_embedding_records_index() {
        let ev = OutputEvent::single_embedding(vec![0.1, 0.2], "emb", 3);
        assert_eq!(ev.index, 3);
    }
}
