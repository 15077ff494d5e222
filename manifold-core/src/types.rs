//! OpenAI-compatible request types.
//!
//! Kept wire-compatible with the OpenAI REST API so SDK clients work
//! unmodified.  Every JSON-carried request preserves the original body in
//! `raw` – the cluster layer forwards that verbatim so workers see exactly
//! what the client sent, extension fields included.

use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn default_one_f32() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_n() -> u32 {
    1
}

// ── Chat ──────────────────────────────────────────────────────────────────────

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Target model name.
    #[serde(default)]
    pub model: String,
    /// Conversation history, passed to the callback untouched.
    #[serde(default)]
    pub messages: Value,
    /// When `true`, the response is streamed as SSE chunks.
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_one_f32")]
    pub temperature: f32,
    #[serde(default = "default_one_f32")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_n")]
    pub n: u32,
    /// Stop sequences; accepts a single string or an array.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    /// The complete request body as received.
    #[serde(skip)]
    pub raw: Value,
}

impl ChatRequest {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut req: Self = serde_json::from_value(value.clone())?;
        req.raw = value;
        Ok(req)
    }
}

// ── Embeddings ────────────────────────────────────────────────────────────────

/// Request body for `POST /v1/embeddings`.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,
    /// One entry per input; a bare string becomes a one-element batch.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub input: Vec<String>,
    #[serde(default = "EmbeddingRequest::default_encoding_format")]
    pub encoding_format: String,
    #[serde(default)]
    pub dimensions: Option<u32>,
    #[serde(skip)]
    pub raw: Value,
}

impl EmbeddingRequest {
    fn default_encoding_format() -> String {
        "float".to_owned()
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut req: Self = serde_json::from_value(value.clone())?;
        req.raw = value;
        Ok(req)
    }
}

// ── Audio transcription / translation ─────────────────────────────────────────

/// A transcription (or translation) request, built from a multipart form
/// rather than JSON.
#[derive(Debug, Clone, Default)]
pub struct AsrRequest {
    pub model: String,
    pub language: String,
    pub prompt: String,
    /// `json` (default), `text`, `srt`, `verbose_json`, or `vtt`.
    pub response_format: String,
    pub temperature: f32,
    /// Decoded bytes of the uploaded audio file.
    pub audio: Bytes,
    /// Original upload filename, when the form carried one.
    pub filename: String,
    /// The unparsed multipart body, for callbacks that want it whole.
    pub raw_body: Bytes,
}

impl AsrRequest {
    /// Rebuild a request from the structured fields a master forwards to a
    /// worker.  The audio rides as base64 under `"audio"`.
    pub fn from_value(value: &Value) -> Self {
        use base64::Engine as _;
        let audio = value
            .get("audio")
            .and_then(Value::as_str)
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
            .map(Bytes::from)
            .unwrap_or_default();
        Self {
            model: str_field(value, "model"),
            language: str_field(value, "language"),
            prompt: str_field(value, "prompt"),
            response_format: value
                .get("response_format")
                .and_then(Value::as_str)
                .unwrap_or("json")
                .to_owned(),
            temperature: value
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as f32,
            filename: str_field(value, "filename"),
            audio,
            raw_body: Bytes::new(),
        }
    }

    /// The structured-field form sent over the cluster forward path.
    pub fn to_forward_value(&self) -> Value {
        use base64::Engine as _;
        serde_json::json!({
            "model": self.model,
            "language": self.language,
            "prompt": self.prompt,
            "response_format": self.response_format,
            "temperature": self.temperature,
            "filename": self.filename,
            "audio": base64::engine::general_purpose::STANDARD.encode(&self.audio),
        })
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

// ── Text-to-speech ────────────────────────────────────────────────────────────

/// Request body for `POST /v1/audio/speech`.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsRequest {
    #[serde(default)]
    pub model: String,
    /// Text to synthesise.
    #[serde(default)]
    pub input: String,
    #[serde(default = "TtsRequest::default_voice")]
    pub voice: String,
    /// `mp3` (default), `opus`, `aac`, `flac`, `wav`, or `pcm`.
    #[serde(default = "TtsRequest::default_response_format")]
    pub response_format: String,
    #[serde(default = "default_one_f32")]
    pub speed: f32,
    #[serde(skip)]
    pub raw: Value,
}

impl TtsRequest {
    fn default_voice() -> String {
        "alloy".to_owned()
    }

    fn default_response_format() -> String {
        "mp3".to_owned()
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut req: Self = serde_json::from_value(value.clone())?;
        req.raw = value;
        Ok(req)
    }
}

// ── Image generation ──────────────────────────────────────────────────────────

/// Request body for `POST /v1/images/generations`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "ImageGenRequest::default_model")]
    pub model: String,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default = "ImageGenRequest::default_quality")]
    pub quality: String,
    /// `url` (default) or `b64_json`.
    #[serde(default = "ImageGenRequest::default_response_format")]
    pub response_format: String,
    #[serde(default = "ImageGenRequest::default_size")]
    pub size: String,
    #[serde(default = "ImageGenRequest::default_style")]
    pub style: String,
    #[serde(skip)]
    pub raw: Value,
}

impl ImageGenRequest {
    fn default_model() -> String {
        "dall-e-2".to_owned()
    }

    fn default_quality() -> String {
        "standard".to_owned()
    }

    fn default_response_format() -> String {
        "url".to_owned()
    }

    fn default_size() -> String {
        "1024x1024".to_owned()
    }

    fn default_style() -> String {
        "vivid".to_owned()
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut req: Self = serde_json::from_value(value.clone())?;
        req.raw = value;
        Ok(req)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_defaults_and_raw_round_trip() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "custom_extension": {"x": 1},
        });
        let req = ChatRequest::from_value(body.clone()).unwrap();
        assert_eq!(req.model, "gpt-4");
        assert!(!req.stream);
        assert_eq!(req.temperature, 1.0);
        assert_eq!(req.max_tokens, 2048);
        assert_eq!(req.n, 1);
        assert_eq!(req.raw, body, "raw must preserve unknown fields");
    }

    #[test]
    fn chat_stop_accepts_string_or_array() {
        let one = ChatRequest::from_value(json!({"model": "m", "stop": "###"})).unwrap();
        assert_eq!(one.stop, ["###"]);
        let many = ChatRequest::from_value(json!({"model": "m", "stop": ["a", "b"]})).unwrap();
        assert_eq!(many.stop, ["a", "b"]);
    }

    #[test]
    fn embedding_input_accepts_string_or_array() {
        let one = EmbeddingRequest::from_value(json!({"model": "e", "input": "hello"})).unwrap();
        assert_eq!(one.input, ["hello"]);
        let many =
            EmbeddingRequest::from_value(json!({"model": "e", "input": ["a", "b", "c"]})).unwrap();
        assert_eq!(many.input.len(), 3);
        assert_eq!(many.encoding_format, "float");
    }

    #[test]
    fn tts_and_image_defaults() {
        let tts = TtsRequest::from_value(json!({"model": "t", "input": "hi"})).unwrap();
        assert_eq!(tts.voice, "alloy");
        assert_eq!(tts.response_format, "mp3");
        assert_eq!(tts.speed, 1.0);

        let img = ImageGenRequest::from_value(json!({"prompt": "a cat"})).unwrap();
        assert_eq!(img.model, "dall-e-2");
        assert_eq!(img.response_format, "url");
        assert_eq!(img.size, "1024x1024");
    }

    #[test]
    fn asr_forward_value_round_trips_audio() {
        let req = AsrRequest {
            model: "whisper-1".into(),
            language: "en".into(),
            response_format: "json".into(),
            audio: Bytes::from_static(b"RIFFfake"),
            filename: "clip.wav".into(),
            ..Default::default()
        };
        let forwarded = req.to_forward_value();
        let back = AsrRequest::from_value(&forwarded);
        assert_eq!(back.model, "whisper-1");
        assert_eq!(back.language, "en");
        assert_eq!(back.filename, "clip.wav");
        assert_eq!(&back.audio[..], b"RIFFfake");
    }

    #[test]
    fn missing_model_parses_as_empty() {
        let req = ChatRequest::from_value(json!({"messages": []})).unwrap();
        assert!(req.model.is_empty());
    }
}
