//! # hark-core
//!
//! Streaming Whisper frontend: a causal log-mel feature buffer and
//! grammar-constrained decoding on top of a pluggable inference engine.
//!
//! ## Architecture
//!
//! ```text
//! samples → StreamHandle → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                │
//!                                      FeatureBuffer (log-mel frames)
//!                                                │
//!                                 Orchestrator ──► InferenceEngine ──► DecodeConstraints
//!                                                │                          │
//!                                                │                   RequestRegistry
//!                                                ▼
//!                                   broadcast::Sender<TranscriptEvent>
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod features;
pub mod inference;
pub mod ipc;
#[cfg(feature = "tokenizer")]
pub mod tokenizer;
pub mod transcript;
pub mod vocab;

// Convenience re-exports for downstream crates
pub use config::{DecodeConfig, FrontendConfig, HarkConfig};
pub use decode::{DecodeConstraints, DecodeContext, DecodeHook, RequestRegistry};
pub use engine::{HarkEngine, Orchestrator, StreamHandle, TranscribeOptions, TranscribeResponse};
pub use error::{HarkError, Result};
pub use features::{FeatureBuffer, LogMelSpectrogram, SpectralTransform};
pub use inference::{EngineHandle, InferenceEngine, RequestId, StubEngine};
pub use ipc::events::{EngineStatus, EngineStatusEvent, TranscriptEvent, TranscriptSegment};
pub use transcript::TokenDecoder;
pub use vocab::{TokenId, Vocabulary};

#[cfg(feature = "tokenizer")]
pub use tokenizer::WhisperTokenizer;
