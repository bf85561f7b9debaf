//! `Orchestrator`: request submission and retrieval against the inference
//! engine, with decode-context bookkeeping.
//!
//! ```text
//! enqueue_transcribe_request ──► InferenceEngine::reserve_request_id ──► id
//!                                ├─► RequestRegistry::register_context(id)
//!                                └─► InferenceEngine::enqueue_request(id)
//! await_transcribe_response  ──► InferenceEngine::await_response(id)
//!                                └─► is_final / error → unregister(id)
//! ```
//!
//! Cheap to clone: every field is shared. The streaming pipeline owns a
//! clone and drives it from its worker thread.

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::HarkConfig;
use crate::decode::{DecodeConstraints, DecodeContext, DecodeHook, RequestRegistry};
use crate::error::{HarkError, Result};
use crate::inference::{EngineHandle, GenerationRequest, RequestId, SamplingConfig};
use crate::vocab::{TokenId, Vocabulary};

/// Per-stream transcription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranscribeOptions {
    pub sampling: SamplingConfig,
    /// Fixed language tag. `None` detects the language on the first window.
    pub language: Option<TokenId>,
    /// Text tokens placed after start-of-prev for the first window.
    pub initial_prompt: Vec<TokenId>,
    /// Carry each window's output into the next window's prompt.
    pub condition_on_previous_text: bool,
    /// Suppress space and end-of-text at the first text position.
    pub suppress_blank: bool,
    /// Latest first timestamp, in seconds. `None` leaves it unbounded.
    pub max_initial_timestamp: Option<f32>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            language: None,
            initial_prompt: Vec::new(),
            condition_on_previous_text: true,
            suppress_blank: true,
            max_initial_timestamp: Some(1.0),
        }
    }
}

/// One transcribe response, as handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeResponse {
    pub is_final: bool,
    pub is_sequence_final: bool,
    /// Generated tokens, prompt excluded.
    pub tokens: Vec<TokenId>,
    pub avg_log_prob: f32,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: HarkConfig,
    engine: EngineHandle,
    registry: Arc<RequestRegistry>,
    constraints: Arc<DecodeConstraints>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("in_flight", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        config: HarkConfig,
        engine: EngineHandle,
        registry: Arc<RequestRegistry>,
        constraints: Arc<DecodeConstraints>,
    ) -> Self {
        Self {
            config,
            engine,
            registry,
            constraints,
        }
    }

    pub fn config(&self) -> &HarkConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        self.constraints.vocabulary()
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn constraints(&self) -> &Arc<DecodeConstraints> {
        &self.constraints
    }

    // ── Language detection ────────────────────────────────────────────────

    /// Submit a one-token generation seeded with start-of-transcript.
    pub fn enqueue_detect_language_request(&self, features: Array2<f32>) -> Result<RequestId> {
        let vocab = self.vocabulary();
        let request = GenerationRequest::new(
            features,
            vec![vocab.start_of_transcript],
            1,
            DecodeHook::LanguageDetect,
            vocab,
        );
        let id = self.engine.0.reserve_request_id()?;
        self.engine.0.enqueue_request(id, request)?;
        debug!(request = %id, "language detection enqueued");
        Ok(id)
    }

    /// Block until the detection finishes and return the language tag.
    pub fn await_detect_language_response(&self, id: RequestId) -> Result<TokenId> {
        loop {
            let response = self.engine.0.await_response(id)?;
            if !response.is_final {
                continue;
            }
            return response
                .output_tokens
                .first()
                .copied()
                .ok_or_else(|| HarkError::Inference(format!("request {id} produced no language tag")));
        }
    }

    // ── Transcription ─────────────────────────────────────────────────────

    /// Submit a multi-token generation under the full timestamp grammar.
    pub fn enqueue_transcribe_request(
        &self,
        features: Array2<f32>,
        prompt: Vec<TokenId>,
        options: &TranscribeOptions,
        stop_on_timestamps: bool,
    ) -> Result<RequestId> {
        let context = DecodeContext {
            prompt_len: prompt.len(),
            stop_after_first_segment: stop_on_timestamps,
            suppress_blank: options.suppress_blank,
            max_initial_timestamp: options.max_initial_timestamp.map(Vocabulary::timestamp_steps),
            steps: 0,
        };
        let request = GenerationRequest::new(
            features,
            prompt,
            self.config.decode.max_new_tokens,
            DecodeHook::transcribe(stop_on_timestamps),
            self.vocabulary(),
        )
        .with_sampling(options.sampling.clone());

        // Registered before submission so the first decode step sees it.
        let id = self.engine.0.reserve_request_id()?;
        self.registry.register_context(id, context);
        if let Err(e) = self.engine.0.enqueue_request(id, request) {
            self.registry.unregister(id);
            return Err(e);
        }
        debug!(request = %id, prompt_len = context.prompt_len, stop_on_timestamps, "transcription enqueued");
        Ok(id)
    }

    /// Block until the next response is ready. The decode context is dropped
    /// on the final response and on any engine error.
    pub fn await_transcribe_response(&self, id: RequestId) -> Result<TranscribeResponse> {
        let response = match self.engine.0.await_response(id) {
            Ok(r) => r,
            Err(e) => {
                self.registry.unregister(id);
                warn!(request = %id, error = %e, "transcription failed");
                return Err(e);
            }
        };
        if response.is_final {
            self.registry.unregister(id);
        }
        Ok(TranscribeResponse {
            is_final: response.is_final,
            is_sequence_final: response.is_sequence_final,
            avg_log_prob: response.cum_log_prob / (response.generated_len as f32 + 1.0),
            tokens: response.output_tokens,
        })
    }

    /// Non-blocking readiness poll.
    pub fn is_response_ready(&self, id: RequestId) -> Result<bool> {
        Ok(self.engine.0.num_responses_ready(id)? > 0)
    }

    // ── Async wrappers ────────────────────────────────────────────────────

    pub async fn detect_language(&self, features: Array2<f32>) -> Result<TokenId> {
        let id = self.enqueue_detect_language_request(features)?;
        self.wait_until_ready(id).await?;
        self.await_detect_language_response(id)
    }

    /// Submit and poll until the final response, which is returned.
    pub async fn transcribe(
        &self,
        features: Array2<f32>,
        prompt: Vec<TokenId>,
        options: &TranscribeOptions,
        stop_on_timestamps: bool,
    ) -> Result<TranscribeResponse> {
        let id = self.enqueue_transcribe_request(features, prompt, options, stop_on_timestamps)?;
        loop {
            if let Err(e) = self.wait_until_ready(id).await {
                self.registry.unregister(id);
                return Err(e);
            }
            let response = self.await_transcribe_response(id)?;
            if response.is_final {
                return Ok(response);
            }
        }
    }

    async fn wait_until_ready(&self, id: RequestId) -> Result<()> {
        let poll = Duration::from_millis(self.config.decode.response_poll_ms);
        while !self.is_response_ready(id)? {
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }

    // ── Prompt construction ───────────────────────────────────────────────

    /// `[start_of_prev, previous…]` (when there is any) followed by
    /// `[start_of_transcript, language?, transcribe]`. Only the last
    /// `max_prompt_tokens` previous tokens are kept.
    pub fn build_prompt(&self, language: Option<TokenId>, previous: &[TokenId]) -> Vec<TokenId> {
        let vocab = self.vocabulary();
        let keep = previous.len().min(self.config.decode.max_prompt_tokens);
        let previous = &previous[previous.len() - keep..];

        let mut prompt = Vec::with_capacity(previous.len() + 4);
        if !previous.is_empty() {
            prompt.push(vocab.start_of_prev);
            prompt.extend_from_slice(previous);
        }
        prompt.push(vocab.start_of_transcript);
        prompt.extend(language);
        prompt.push(vocab.transcribe);
        prompt
    }
}
