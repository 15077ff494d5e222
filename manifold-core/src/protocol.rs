//! The cluster control protocol: a fixed 16-byte little-endian header
//! followed by a UTF-8 JSON payload.
//!
//! ```text
//! offset 0  magic          0x4F414943 ("OAIC")
//! offset 4  version        1
//! offset 8  type           FrameType as u32
//! offset 12 payload_length bytes of JSON that follow
//! ```
//!
//! Frames travel as HTTP POST bodies (`application/octet-stream`) on the
//! `/internal/*` paths; the header lets either side reject traffic from
//! anything that is not a manifold peer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::router::Modality;

/// "OAIC" – identifies manifold cluster traffic.
pub const FRAME_MAGIC: u32 = 0x4F41_4943;
pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// Control-plane message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Handshake = 1,
    HandshakeAck = 2,
    RegisterModel = 3,
    RegisterAck = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
    ForwardRequest = 7,
    ForwardResponse = 8,
    Error = 9,
    Disconnect = 10,
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(v: u32) -> Result<Self, FrameError> {
        Ok(match v {
            1 => FrameType::Handshake,
            2 => FrameType::HandshakeAck,
            3 => FrameType::RegisterModel,
            4 => FrameType::RegisterAck,
            5 => FrameType::Heartbeat,
            6 => FrameType::HeartbeatAck,
            7 => FrameType::ForwardRequest,
            8 => FrameType::ForwardResponse,
            9 => FrameType::Error,
            10 => FrameType::Disconnect,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// Model families as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ModelType {
    Chat = 1,
    Embedding = 2,
    Asr = 3,
    Tts = 4,
    ImageGen = 5,
}

impl ModelType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ModelType {
    type Error = FrameError;

    fn try_from(v: u32) -> Result<Self, FrameError> {
        Ok(match v {
            1 => ModelType::Chat,
            2 => ModelType::Embedding,
            3 => ModelType::Asr,
            4 => ModelType::Tts,
            5 => ModelType::ImageGen,
            other => return Err(FrameError::UnknownModelType(other)),
        })
    }
}

impl From<Modality> for ModelType {
    fn from(m: Modality) -> Self {
        match m {
            Modality::Chat => ModelType::Chat,
            Modality::Embedding => ModelType::Embedding,
            Modality::Asr => ModelType::Asr,
            Modality::Tts => ModelType::Tts,
            Modality::ImageGen => ModelType::ImageGen,
        }
    }
}

impl From<ModelType> for Modality {
    fn from(t: ModelType) -> Self {
        match t {
            ModelType::Chat => Modality::Chat,
            ModelType::Embedding => Modality::Embedding,
            ModelType::Asr => Modality::Asr,
            ModelType::Tts => Modality::Tts,
            ModelType::ImageGen => Modality::ImageGen,
        }
    }
}

/// Frame decode failures.  Any of these on an `/internal/` endpoint is an
/// HTTP 400 with no state change.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame shorter than the {HEADER_LEN}-byte header")]
    TooShort,

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),

    #[error("unknown frame type: {0}")]
    UnknownType(u32),

    #[error("unknown model type: {0}")]
    UnknownModelType(u32),

    #[error("payload truncated: header says {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid payload JSON: {0}")]
    Payload(String),
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Value,
}

impl Frame {
    /// Deserialise the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| FrameError::Payload(e.to_string()))
    }
}

/// Serialise a frame: header + JSON payload.
pub fn encode_frame<P: Serialize>(frame_type: FrameType, payload: &P) -> Bytes {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32_le(FRAME_MAGIC);
    buf.put_u32_le(PROTOCOL_VERSION);
    buf.put_u32_le(frame_type as u32);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

/// Parse a frame, validating magic, version, type, and payload length.
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::TooShort);
    }
    let mut header = &data[..HEADER_LEN];
    let magic = header.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = header.get_u32_le();
    if version != PROTOCOL_VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let frame_type = FrameType::try_from(header.get_u32_le())?;
    let payload_len = header.get_u32_le() as usize;

    let body = &data[HEADER_LEN..];
    if body.len() < payload_len {
        return Err(FrameError::Truncated {
            expected: payload_len,
            actual: body.len(),
        });
    }
    let payload = if payload_len == 0 {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body[..payload_len])
            .map_err(|e| FrameError::Payload(e.to_string()))?
    };

    Ok(Frame {
        frame_type,
        payload,
    })
}

// ── Typed payloads ─────────────────────────────────────────────────────────────

/// HANDSHAKE: a worker (or the auto-mode probe) introduces itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub worker_id: String,
    /// Externally reachable address of the worker's forward endpoint.
    #[serde(default)]
    pub worker_host: String,
    /// 0 while the worker has not bound its endpoint yet.
    #[serde(default)]
    pub worker_port: u16,
    #[serde(default)]
    pub timestamp: i64,
}

/// HANDSHAKE_ACK: the master accepts and reports its own address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAckPayload {
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub master_host: String,
    #[serde(default)]
    pub master_port: u16,
}

/// REGISTER_MODEL: one model offered by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModelPayload {
    pub worker_id: String,
    #[serde(default)]
    pub worker_host: String,
    #[serde(default)]
    pub worker_port: u16,
    pub model_type: u32,
    pub model_name: String,
}

/// REGISTER_ACK: accept/reject with a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAckPayload {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// HEARTBEAT: carries the current address so the master tracks changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: String,
    #[serde(default)]
    pub worker_host: String,
    #[serde(default)]
    pub worker_port: u16,
}

/// FORWARD_REQUEST: master → worker, one client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequestPayload {
    pub request_id: String,
    pub model_type: u32,
    pub request: Value,
}

/// FORWARD_RESPONSE: worker → master, the complete (possibly chunked)
/// result correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponsePayload {
    pub request_id: String,
    pub response: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// ERROR payload, also used as the `response` of an error FORWARD_RESPONSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = HandshakePayload {
            worker_id: "worker_ab12cd34".into(),
            worker_host: "10.0.0.7".into(),
            worker_port: 28080,
            timestamp: 1_700_000_000,
        };
        let bytes = encode_frame(FrameType::Handshake, &payload);
        assert_eq!(&bytes[..4], &FRAME_MAGIC.to_le_bytes());

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Handshake);
        let back: HandshakePayload = frame.payload_as().unwrap();
        assert_eq!(back.worker_id, "worker_ab12cd34");
        assert_eq!(back.worker_port, 28080);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = encode_frame(FrameType::Heartbeat, &serde_json::json!({}));
        assert_eq!(bytes[0..4], FRAME_MAGIC.to_le_bytes());
        assert_eq!(bytes[4..8], PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(bytes[8..12], 5u32.to_le_bytes());
        assert_eq!(bytes[12..16], 2u32.to_le_bytes()); // "{}"
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = encode_frame(FrameType::Heartbeat, &serde_json::json!({})).to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameError::BadMagic(_))
        ));

        let mut bytes = encode_frame(FrameType::Heartbeat, &serde_json::json!({})).to_vec();
        bytes[4] = 9;
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameError::BadVersion(9))
        ));
    }

    #[test]
    fn rejects_short_and_truncated_frames() {
        assert!(matches!(decode_frame(&[0u8; 7]), Err(FrameError::TooShort)));

        let bytes = encode_frame(
            FrameType::ForwardRequest,
            &serde_json::json!({"request_id": "req_1"}),
        );
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode_frame(cut),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut bytes = encode_frame(FrameType::Heartbeat, &serde_json::json!({})).to_vec();
        bytes[8] = 42;
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameError::UnknownType(42))
        ));
    }

    #[test]
    fn model_type_maps_to_modality_and_back() {
        for ty in [
            ModelType::Chat,
            ModelType::Embedding,
            ModelType::Asr,
            ModelType::Tts,
            ModelType::ImageGen,
        ] {
            let m: Modality = ty.into();
            assert_eq!(ModelType::from(m), ty);
            assert_eq!(ModelType::try_from(ty.as_u32()).unwrap(), ty);
        }
        assert!(ModelType::try_from(0).is_err());
        assert!(ModelType::try_from(6).is_err());
    }

    #[test]
    fn empty_payload_decodes_to_empty_object() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(FRAME_MAGIC);
        buf.put_u32_le(PROTOCOL_VERSION);
        buf.put_u32_le(FrameType::Disconnect as u32);
        buf.put_u32_le(0);
        let frame = decode_frame(&buf).unwrap();
        assert_eq!(frame.frame_type, FrameType::Disconnect);
        assert!(frame.payload.as_object().unwrap().is_empty());
    }
}
