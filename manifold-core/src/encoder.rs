//! OpenAI wire-format encoders: pure functions from an [`OutputEvent`] to
//! the JSON (or text) the SDKs expect.
//!
//! The transport layer owns everything around the encoded value – SSE
//! `data:` framing, the `[DONE]` marker, content types, HTTP status.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::event::{EventKind, OutputEvent};

fn ensure_id(id: &str, prefix: &str) -> String {
    if id.is_empty() {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    } else {
        id.to_owned()
    }
}

fn ensure_created(created: i64) -> i64 {
    if created == 0 {
        Utc::now().timestamp()
    } else {
        created
    }
}

fn ensure_model(model: &str, fallback: &str) -> String {
    if model.is_empty() {
        fallback.to_owned()
    } else {
        model.to_owned()
    }
}

/// The OpenAI error body: `{"error":{"message","type","code"}}`.
pub fn error_body(code: &str, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": code,
            "code": code,
        }
    })
}

/// Streamed chat encodings (`object: "chat.completion.chunk"`).
pub mod sse {
    use super::*;

    /// Encode one event as a chat-completion chunk.  `TextDelta` becomes a
    /// delta chunk (`finish_reason: null`), `FinalText` the finishing chunk
    /// (empty delta, `finish_reason: "stop"` unless overridden), `Error`
    /// the OpenAI error body.  `None` for kinds with no SSE form – the
    /// `End` marker is emitted by the transport as `data: [DONE]`.
    pub fn chat_chunk(event: &OutputEvent) -> Option<Value> {
        match &event.kind {
            EventKind::TextDelta { text } => Some(json!({
                "id": ensure_id(&event.id, "chatcmpl"),
                "object": "chat.completion.chunk",
                "created": ensure_created(event.created),
                "model": ensure_model(&event.model, "gpt-4"),
                "choices": [{
                    "index": event.index,
                    "delta": {"role": "assistant", "content": text},
                    "finish_reason": null,
                }],
            })),
            EventKind::FinalText { finish_reason, .. } => Some(json!({
                "id": ensure_id(&event.id, "chatcmpl"),
                "object": "chat.completion.chunk",
                "created": ensure_created(event.created),
                "model": ensure_model(&event.model, "gpt-4"),
                "choices": [{
                    "index": event.index,
                    "delta": {},
                    "finish_reason": finish_reason.as_deref().unwrap_or("stop"),
                }],
            })),
            EventKind::Error { code, message } => Some(error_body(code, message)),
            _ => None,
        }
    }
}

/// Unary JSON encodings.
pub mod json_body {
    use super::*;
    use base64::Engine as _;

    /// Non-streamed chat completion (`object: "chat.completion"`).
    pub fn chat_completion(event: &OutputEvent) -> Value {
        let (content, finish_reason) = match &event.kind {
            EventKind::FinalText {
                text,
                finish_reason,
            } => (text.as_str(), finish_reason.as_deref().unwrap_or("stop")),
            EventKind::TextDelta { text } => (text.as_str(), "stop"),
            EventKind::Error { code, message } => return error_body(code, message),
            _ => ("", "stop"),
        };
        json!({
            "id": ensure_id(&event.id, "chatcmpl"),
            "object": "chat.completion",
            "created": ensure_created(event.created),
            "model": ensure_model(&event.model, "gpt-4"),
            "choices": [{
                "index": event.index,
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason,
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        })
    }

    /// Embedding list response (single vectors become one-element lists).
    pub fn embedding_list(event: &OutputEvent) -> Value {
        let data: Vec<Value> = match &event.kind {
            EventKind::Embedding { vector } => vec![json!({
                "object": "embedding",
                "index": event.index,
                "embedding": vector,
            })],
            EventKind::Embeddings { vectors } => vectors
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    json!({"object": "embedding", "index": i, "embedding": v})
                })
                .collect(),
            EventKind::Error { code, message } => return error_body(code, message),
            _ => Vec::new(),
        };
        json!({
            "object": "list",
            "data": data,
            "model": ensure_model(&event.model, "text-embedding-ada-002"),
            "usage": {"prompt_tokens": 0, "total_tokens": 0},
        })
    }

    /// Transcription response honouring `response_format`.  Returns the
    /// body string and its content type.
    pub fn transcription(event: &OutputEvent, response_format: &str) -> (String, &'static str) {
        if let EventKind::Error { code, message } = &event.kind {
            return (error_body(code, message).to_string(), "application/json");
        }
        let text = event.text().unwrap_or_default();
        match response_format {
            "text" => (text.to_owned(), "text/plain"),
            "verbose_json" => {
                let mut body = json!({
                    "task": "transcribe",
                    "language": "",
                    "duration": 0.0,
                    "text": text,
                    "segments": [],
                });
                // A Json event may carry richer detail from the model.
                if let EventKind::Json { value } = &event.kind {
                    if let Some(segments) = value.get("segments") {
                        body["segments"] = segments.clone();
                    }
                    if let Some(t) = value.get("text") {
                        body["text"] = t.clone();
                    }
                }
                (body.to_string(), "application/json")
            }
            _ => (json!({"text": text}).to_string(), "application/json"),
        }
    }

    /// DALL·E-shaped image response: bytes become `b64_json`, a `Json`
    /// event (URL style) passes through verbatim.
    pub fn image_list(event: &OutputEvent) -> Value {
        match &event.kind {
            EventKind::ImageBytes { data, .. } => json!({
                "created": ensure_created(event.created),
                "data": [{
                    "b64_json": base64::engine::general_purpose::STANDARD.encode(data),
                    "revised_prompt": "",
                }],
            }),
            EventKind::Json { value } => value.clone(),
            EventKind::Error { code, message } => error_body(code, message),
            _ => json!({
                "created": ensure_created(event.created),
                "data": [],
            }),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn sse_delta_chunk_shape() {
        let chunk = sse::chat_chunk(&OutputEvent::text_delta("Hel", "gpt-4")).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "gpt-4");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hel");
        assert!(chunk["choices"][0]["finish_reason"].is_null());
        assert!(chunk["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }

    #[test]
    fn sse_final_chunk_has_stop_and_empty_delta() {
        let chunk = sse::chat_chunk(&OutputEvent::final_text("", "gpt-4")).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
        assert!(chunk["choices"][0]["delta"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sse_respects_custom_finish_reason() {
        let ev = OutputEvent::final_text_with_reason("", "length", "m");
        let chunk = sse::chat_chunk(&ev).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn sse_skips_unstreamable_kinds() {
        assert!(sse::chat_chunk(&OutputEvent::end()).is_none());
        assert!(sse::chat_chunk(&OutputEvent::batch_embeddings(vec![], "m")).is_none());
    }

    #[test]
    fn unary_chat_completion_shape() {
        let body = json_body::chat_completion(&OutputEvent::final_text("Hello", "gpt-4"));
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["usage"]["total_tokens"].is_number());
    }

    #[test]
    fn embedding_list_batch_indexes_sequentially() {
        let ev = OutputEvent::batch_embeddings(vec![vec![0.1], vec![0.2], vec![0.3]], "emb");
        let body = json_body::embedding_list(&ev);
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
        assert_eq!(body["data"][2]["index"], 2);
        assert_eq!(body["model"], "emb");
    }

    #[test]
    fn embedding_single_keeps_its_index() {
        let ev = OutputEvent::single_embedding(vec![1.0, 2.0], "emb", 5);
        let body = json_body::embedding_list(&ev);
        assert_eq!(body["data"][0]["index"], 5);
    }

    #[test]
    fn transcription_formats() {
        let ev = OutputEvent::final_text("hello world", "whisper-1");
        let (body, ct) = json_body::transcription(&ev, "json");
        assert_eq!(ct, "application/json");
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap()["text"],
            "hello world"
        );

        let (body, ct) = json_body::transcription(&ev, "text");
        assert_eq!(ct, "text/plain");
        assert_eq!(body, "hello world");

        let (body, _) = json_body::transcription(&ev, "verbose_json");
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["task"], "transcribe");
        assert_eq!(parsed["text"], "hello world");
    }

    #[test]
    fn image_bytes_become_b64() {
        use base64::Engine as _;
        let ev = OutputEvent::image(Bytes::from_static(b"\x89PNG"), "image/png", "sd");
        let body = json_body::image_list(&ev);
        let b64 = body["data"][0]["b64_json"].as_str().unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .unwrap(),
            b"\x89PNG"
        );
    }

    #[test]
    fn image_json_event_passes_through() {
        let urls = json!({"created": 1, "data": [{"url": "http://example/img.png"}]});
        let ev = OutputEvent::json(urls.clone(), "sd");
        assert_eq!(json_body::image_list(&ev), urls);
    }

    #[test]
    fn error_body_shape() {
        let body = error_body("invalid_request_error", "Missing 'model' field");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "Missing 'model' field");
    }
}
