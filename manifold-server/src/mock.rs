//! Demonstration model callbacks for the example binaries.
//!
//! The binaries accept `--models name1,name2,…` and need something to
//! serve without a real inference engine attached; the name's prefix
//! picks the modality, mirroring common OpenAI model families.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use manifold_core::{ModelRouter, OutputEvent};

/// Register a demonstration callback for each name, choosing the modality
/// from the name.  Unrecognised names become chat models.
pub fn register_models(router: &ModelRouter, names: &[String]) {
    for name in names {
        let lower = name.to_lowercase();
        if lower.starts_with("whisper") || lower.starts_with("sensevoice") {
            register_asr(router, name);
        } else if lower.contains("embedding") {
            register_embedding(router, name);
        } else if lower.starts_with("tts") || lower.contains("speech") {
            register_tts(router, name);
        } else if lower.starts_with("dall-e") || lower.starts_with("sd-") {
            register_image_gen(router, name);
        } else {
            register_chat(router, name);
        }
    }
}

fn register_chat(router: &ModelRouter, name: &str) {
    let model = name.to_owned();
    info!(model = name, "registering mock chat model");
    router.register_chat(
        name,
        Arc::new(move |req, provider| {
            let reply = format!("[Mock {model}] This is a response from {model}");
            if req.stream {
                for word in reply.split_inclusive(' ') {
                    provider.push(OutputEvent::text_delta(word, &req.model));
                    std::thread::sleep(Duration::from_millis(50));
                }
                provider.push(OutputEvent::final_text("", &req.model));
            } else {
                provider.push(OutputEvent::final_text(reply, &req.model));
            }
            provider.end();
        }),
    );
}

fn register_asr(router: &ModelRouter, name: &str) {
    let model = name.to_owned();
    info!(model = name, "registering mock ASR model");
    router.register_asr(
        name,
        Arc::new(move |req, provider| {
            let transcript = format!(
                "[Mock {model}] Transcribed {} bytes of audio",
                req.audio.len()
            );
            provider.push(OutputEvent::final_text(transcript, &req.model));
            provider.end();
        }),
    );
}

fn register_embedding(router: &ModelRouter, name: &str) {
    info!(model = name, "registering mock embedding model");
    router.register_embedding(
        name,
        Arc::new(move |req, provider| {
            // Deterministic per-input vectors; enough for SDK round-trips.
            let vectors: Vec<Vec<f32>> = req
                .input
                .iter()
                .map(|input| {
                    (0..16)
                        .map(|i| ((input.len() + i) % 7) as f32 / 7.0)
                        .collect()
                })
                .collect();
            provider.push(OutputEvent::batch_embeddings(vectors, &req.model));
            provider.end();
        }),
    );
}

fn register_tts(router: &ModelRouter, name: &str) {
    info!(model = name, "registering mock TTS model");
    router.register_tts(
        name,
        Arc::new(move |req, provider| {
            // A WAV header followed by silence; real engines plug in here.
            let mut wav = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
            wav.extend_from_slice(req.input.as_bytes());
            provider.push(OutputEvent::audio(wav, "audio/wav", &req.model));
            provider.end();
        }),
    );
}

fn register_image_gen(router: &ModelRouter, name: &str) {
    info!(model = name, "registering mock image model");
    router.register_image_gen(
        name,
        Arc::new(move |req, provider| {
            let png = b"\x89PNG\r\n\x1a\n".to_vec();
            provider.push(OutputEvent::image(png, "image/png", &req.model));
            provider.end();
        }),
    );
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::Modality;

    #[test]
    fn prefixes_pick_the_modality() {
        let router = ModelRouter::new();
        register_models(
            &router,
            &[
                "gpt-4".into(),
                "whisper-1".into(),
                "text-embedding-ada-002".into(),
                "tts-1".into(),
                "dall-e-2".into(),
            ],
        );
        assert!(router.has(Modality::Chat, "gpt-4"));
        assert!(router.has(Modality::Asr, "whisper-1"));
        assert!(router.has(Modality::Embedding, "text-embedding-ada-002"));
        assert!(router.has(Modality::Tts, "tts-1"));
        assert!(router.has(Modality::ImageGen, "dall-e-2"));
    }
}
