//! Constrained decoding.
//!
//! ```text
//! InferenceEngine worker ──(hook, request id, scores[beam][vocab], histories)──► DecodeConstraints
//!                                                                                   │ one lookup
//!                                                                                   ▼
//!                                                                           RequestRegistry
//! ```
//!
//! The engine owns the score tensor; the hook borrows it mutably for one
//! decode step and never retains it.

pub mod constraints;
pub mod logits;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use constraints::DecodeConstraints;
pub use logits::BeamScores;
pub use registry::{DecodeContext, RequestRegistry};

/// Which grammar a generation request is decoded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecodeHook {
    /// Only language tags may be produced.
    LanguageDetect,
    /// Full timestamp grammar, any number of segments.
    Transcribe,
    /// Full grammar, end-of-text forced once the first segment closes.
    TranscribeSegment,
}

impl DecodeHook {
    /// Transcribe hooks for the given single-segment setting.
    pub fn transcribe(stop_on_timestamps: bool) -> Self {
        if stop_on_timestamps {
            Self::TranscribeSegment
        } else {
            Self::Transcribe
        }
    }
}
