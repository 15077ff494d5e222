//! manifold-core – the protocol-independent heart of the manifold gateway.
//!
//! A model implementation is a callback that receives a typed request and a
//! shared [`Provider`], pushes semantic [`OutputEvent`]s into it, and calls
//! [`Provider::end`].  Everything HTTP-shaped lives in `manifold-server`;
//! this crate only knows about events, queues, routing, the OpenAI output
//! encodings, and the binary cluster frame format.

pub mod encoder;
pub mod event;
pub mod protocol;
pub mod provider;
pub mod router;
pub mod types;

pub use event::{EventKind, OutputEvent};
pub use provider::Provider;
pub use router::{Modality, ModelRouter};
pub use types::{AsrRequest, ChatRequest, EmbeddingRequest, ImageGenRequest, TtsRequest};
