//! Runtime configuration.
//!
//! Loaded from an optional JSON file (missing keys fall back to defaults),
//! then overridden from `HARK_*` environment variables, then validated once.
//! Validation failures are fatal: nothing downstream retries a bad config.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HarkError, Result};
use crate::vocab::Vocabulary;

/// Spectral frontend parameters. Defaults are Whisper's model constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrontendConfig {
    /// Input sample rate in Hz. Audio is expected at this rate already.
    pub sample_rate: u32,
    /// Mel bins per frame. 128 matches the large-v3 default vocabulary;
    /// earlier checkpoints use 80.
    pub n_mels: usize,
    /// Analysis window length in samples.
    pub window_len: usize,
    /// Advance between consecutive frames in samples.
    pub hop_len: usize,
    /// Frames per encoder window (30 s at the default hop).
    pub chunk_frames: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            n_mels: 128,
            window_len: 400,
            hop_len: 160,
            chunk_frames: 3_000,
        }
    }
}

impl FrontendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(HarkError::Config("sample_rate must be positive".into()));
        }
        if self.n_mels == 0 {
            return Err(HarkError::Config("n_mels must be positive".into()));
        }
        validate_window(self.window_len, self.hop_len)?;
        if self.chunk_frames < 2 {
            return Err(HarkError::Config(format!(
                "chunk_frames must be at least 2, got {}",
                self.chunk_frames
            )));
        }
        Ok(())
    }
}

/// Shared window/hop precondition used by config and the feature buffer.
pub(crate) fn validate_window(window_len: usize, hop_len: usize) -> Result<()> {
    if window_len == 0 || hop_len == 0 {
        return Err(HarkError::Config(format!(
            "window ({window_len}) and hop ({hop_len}) must be positive"
        )));
    }
    if hop_len > window_len {
        return Err(HarkError::Config(format!(
            "hop ({hop_len}) must not exceed window ({window_len})"
        )));
    }
    Ok(())
}

/// Generation limits and polling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecodeConfig {
    /// Upper bound on generated tokens per transcribe request.
    pub max_new_tokens: usize,
    /// Upper bound on carried-over previous-text tokens in a prompt.
    pub max_prompt_tokens: usize,
    /// Sleep between readiness polls in the async wrappers.
    pub response_poll_ms: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 96,
            max_prompt_tokens: 223,
            response_poll_ms: 5,
        }
    }
}

/// Top-level configuration for `HarkEngine`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HarkConfig {
    pub frontend: FrontendConfig,
    pub decode: DecodeConfig,
    pub vocabulary: Vocabulary,
}

impl HarkConfig {
    /// Read a (possibly partial) JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `HARK_*` environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_override("HARK_N_MELS") {
            self.frontend.n_mels = v;
        }
        if let Some(v) = env_override("HARK_CHUNK_FRAMES") {
            self.frontend.chunk_frames = v;
        }
        if let Some(v) = env_override("HARK_MAX_NEW_TOKENS") {
            self.decode.max_new_tokens = v;
        }
        if let Some(v) = env_override("HARK_MAX_PROMPT_TOKENS") {
            self.decode.max_prompt_tokens = v;
        }
        if let Some(v) = env_override::<u64>("HARK_RESPONSE_POLL_MS") {
            self.decode.response_poll_ms = v.clamp(1, 1_000);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.frontend.validate()?;
        self.vocabulary.validate()?;
        if self.decode.max_new_tokens == 0 {
            return Err(HarkError::Config("max_new_tokens must be positive".into()));
        }
        Ok(())
    }
}

fn env_override<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}
