//! Inference engine abstraction.
//!
//! The `InferenceEngine` trait decouples the orchestrator from the backend
//! that actually runs the encoder/decoder (a batching model server, a local
//! runtime, or the in-process `StubEngine`).
//!
//! Submission is two-phase and never blocks: `reserve_request_id` issues the
//! id, the caller records whatever per-request state the hook needs under it,
//! then `enqueue_request` starts generation. No decode step can run before
//! that state exists. The engine runs generation on its own worker threads and
//! calls the request's bound [`DecodeHook`] on the shared
//! [`DecodeConstraints`](crate::decode::DecodeConstraints) once per step,
//! before sampling. Retrieval blocks (`await_response`) or polls
//! (`num_responses_ready`). Timeouts and cancellation are the engine's job.

pub mod stub;

use std::fmt;
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::decode::DecodeHook;
use crate::error::Result;
use crate::vocab::{TokenId, Vocabulary};

pub use stub::StubEngine;

/// Opaque request handle issued by the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sampling parameters forwarded to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplingConfig {
    pub beam_width: usize,
    /// `0` disables top-k.
    pub top_k: usize,
    /// `0.0` disables nucleus sampling.
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            top_k: 0,
            top_p: 0.0,
            temperature: 1.0,
        }
    }
}

/// One generation job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Decoder prompt.
    pub input_tokens: Vec<TokenId>,
    pub max_new_tokens: usize,
    /// Encoder input features `[time × mel]`.
    pub encoder_features: Array2<f32>,
    /// Encoder output positions: `frames / 2`.
    pub encoder_output_len: usize,
    pub end_id: TokenId,
    pub pad_id: TokenId,
    /// Grammar the engine must apply at every decode step.
    pub hook: DecodeHook,
    pub sampling: SamplingConfig,
    pub return_log_probs: bool,
}

impl GenerationRequest {
    pub fn new(
        encoder_features: Array2<f32>,
        input_tokens: Vec<TokenId>,
        max_new_tokens: usize,
        hook: DecodeHook,
        vocab: &Vocabulary,
    ) -> Self {
        let encoder_output_len = encoder_features.nrows() / 2;
        Self {
            input_tokens,
            max_new_tokens,
            encoder_features,
            encoder_output_len,
            end_id: vocab.end_of_text,
            pad_id: vocab.end_of_text,
            hook,
            sampling: SamplingConfig::default(),
            return_log_probs: true,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }
}

/// One response for a request. Streaming engines send several; the last one
/// has `is_final` set.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub is_final: bool,
    pub is_sequence_final: bool,
    /// Generated tokens (prompt excluded) of the best beam.
    pub output_tokens: Vec<TokenId>,
    pub cum_log_prob: f32,
    pub generated_len: usize,
}

/// Contract for generation backends.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Issue a fresh id for the next submission. Nothing runs yet.
    fn reserve_request_id(&self) -> Result<RequestId>;

    /// Submit a request under a reserved id. Returns as soon as the engine
    /// has accepted it.
    ///
    /// # Errors
    /// `HarkError::Inference` if `id` is already in flight.
    fn enqueue_request(&self, id: RequestId, request: GenerationRequest) -> Result<()>;

    /// Block until the next response for `id` is available and return it.
    ///
    /// # Errors
    /// `HarkError::UnknownRequest` if `id` is not in flight; engine failures
    /// are returned as-is.
    fn await_response(&self, id: RequestId) -> Result<GenerationResponse>;

    /// Responses for `id` that `await_response` can return without blocking.
    fn num_responses_ready(&self, id: RequestId) -> Result<usize>;
}

/// Thread-safe reference-counted handle to any `InferenceEngine` implementor.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<dyn InferenceEngine>);

impl EngineHandle {
    pub fn new<E: InferenceEngine>(engine: E) -> Self {
        Self(Arc::new(engine))
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_derives_encoder_length_and_end_ids() {
        let vocab = Vocabulary::default();
        let req = GenerationRequest::new(
            Array2::zeros((3_000, 80)),
            vec![vocab.start_of_transcript],
            1,
            DecodeHook::LanguageDetect,
            &vocab,
        );
        assert_eq!(req.encoder_output_len, 1_500);
        assert_eq!(req.end_id, vocab.end_of_text);
        assert_eq!(req.pad_id, vocab.end_of_text);
        assert_eq!(req.sampling, SamplingConfig::default());
    }

    #[test]
    fn odd_frame_counts_round_down() {
        let vocab = Vocabulary::default();
        let req = GenerationRequest::new(Array2::zeros((7, 80)), vec![], 4, DecodeHook::Transcribe, &vocab);
        assert_eq!(req.encoder_output_len, 3);
    }

    #[test]
    fn sampling_config_deserializes_with_defaults() {
        let cfg: SamplingConfig = serde_json::from_str(r#"{"beamWidth": 4}"#).unwrap();
        assert_eq!(cfg.beam_width, 4);
        assert_eq!(cfg.top_k, 0);
        assert_eq!(cfg.temperature, 1.0);
    }
}
