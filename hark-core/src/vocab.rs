//! Whisper vocabulary boundaries.
//!
//! ```text
//! 0 ──── text ──── EOT  SOT  [languages…)  transcribe … startofprev … notimestamps  [timestamps…)
//! ```
//!
//! Every classification is a range check, so the table is cheap to
//! clone into worker threads and never needs a lock.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{HarkError, Result};

/// Numeric token id as produced by the tokenizer / inference engine.
pub type TokenId = u32;

/// Seconds represented by one timestamp-token step.
pub const SECONDS_PER_TIMESTAMP: f32 = 0.02;

/// Feature frames represented by one timestamp-token step
/// (encoder downsamples frames by 2, one encoder position = 20 ms).
pub const FRAMES_PER_TIMESTAMP: usize = 2;

/// Fixed token-id layout of a Whisper model. Must match the tokenizer exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Vocabulary {
    /// Separator / space token, suppressed at the first text position.
    pub space: TokenId,
    pub end_of_text: TokenId,
    pub start_of_transcript: TokenId,
    /// Half-open language-tag range.
    pub languages: Range<TokenId>,
    /// Task token forced right after the language tag.
    pub transcribe: TokenId,
    /// Marks the start of a carried-over previous-text prompt.
    pub start_of_prev: TokenId,
    pub no_timestamps: TokenId,
    /// Half-open timestamp range; `timestamps.start` is `<|0.00|>`.
    pub timestamps: Range<TokenId>,
}

impl Default for Vocabulary {
    /// Multilingual large-v3 layout.
    fn default() -> Self {
        Self {
            space: 220,
            end_of_text: 50_257,
            start_of_transcript: 50_258,
            languages: 50_259..50_359,
            transcribe: 50_360,
            start_of_prev: 50_362,
            no_timestamps: 50_364,
            timestamps: 50_365..51_866,
        }
    }
}

impl Vocabulary {
    /// Check that the ranges are ordered, non-empty and non-overlapping.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(HarkError::Config(format!("vocabulary: {msg}")));

        if self.languages.is_empty() {
            return bad("language range is empty");
        }
        if self.timestamps.is_empty() {
            return bad("timestamp range is empty");
        }
        if self.space >= self.end_of_text {
            return bad("space token must be a text token");
        }
        if self.start_of_transcript <= self.end_of_text {
            return bad("start-of-transcript must follow end-of-text");
        }
        if self.languages.start <= self.start_of_transcript {
            return bad("languages must follow start-of-transcript");
        }
        for (name, id) in [
            ("transcribe", self.transcribe),
            ("start-of-prev", self.start_of_prev),
            ("no-timestamps", self.no_timestamps),
        ] {
            if id < self.languages.end || id >= self.timestamps.start {
                return bad(&format!(
                    "{name} token {id} must lie between languages and timestamps"
                ));
            }
        }
        Ok(())
    }

    /// Size of the score row the inference engine produces.
    pub fn row_len(&self) -> usize {
        self.timestamps.end as usize
    }

    pub fn is_timestamp(&self, token: TokenId) -> bool {
        self.timestamps.contains(&token)
    }

    pub fn is_language(&self, token: TokenId) -> bool {
        self.languages.contains(&token)
    }

    /// Plain text tokens (everything below end-of-text).
    pub fn is_text(&self, token: TokenId) -> bool {
        token < self.end_of_text
    }

    /// Offset of a timestamp token in seconds, `None` for non-timestamps.
    pub fn timestamp_seconds(&self, token: TokenId) -> Option<f32> {
        self.is_timestamp(token)
            .then(|| (token - self.timestamps.start) as f32 * SECONDS_PER_TIMESTAMP)
    }

    /// Offset of a timestamp token in feature frames.
    pub fn timestamp_frames(&self, token: TokenId) -> Option<usize> {
        self.is_timestamp(token)
            .then(|| (token - self.timestamps.start) as usize * FRAMES_PER_TIMESTAMP)
    }

    /// Number of timestamp steps covering `seconds`, rounded to nearest.
    pub fn timestamp_steps(seconds: f32) -> u32 {
        (seconds.max(0.0) / SECONDS_PER_TIMESTAMP).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_layout_is_valid() {
        Vocabulary::default().validate().expect("large-v3 layout");
    }

    #[test]
    fn timestamp_boundary_is_half_open() {
        let v = Vocabulary::default();
        assert!(v.is_timestamp(v.timestamps.start));
        assert!(!v.is_timestamp(v.timestamps.start - 1));
        assert!(v.is_timestamp(v.timestamps.end - 1));
        assert!(!v.is_timestamp(v.timestamps.end));
    }

    #[test]
    fn language_and_text_classification() {
        let v = Vocabulary::default();
        assert!(v.is_language(v.languages.start));
        assert!(!v.is_language(v.start_of_transcript));
        assert!(v.is_text(v.space));
        assert!(!v.is_text(v.end_of_text));
    }

    #[test]
    fn timestamp_seconds_and_frames_scale_from_start() {
        let v = Vocabulary::default();
        assert_eq!(v.timestamp_seconds(v.end_of_text), None);
        assert_relative_eq!(v.timestamp_seconds(v.timestamps.start).unwrap(), 0.0);
        assert_relative_eq!(
            v.timestamp_seconds(v.timestamps.start + 150).unwrap(),
            3.0,
            epsilon = 1e-5
        );
        assert_eq!(v.timestamp_frames(v.timestamps.start + 150), Some(300));
        assert_eq!(Vocabulary::timestamp_steps(1.0), 50);
    }

    #[test]
    fn validate_rejects_overlapping_ranges() {
        let mut v = Vocabulary::default();
        v.transcribe = v.languages.start + 1;
        assert!(matches!(v.validate(), Err(HarkError::Config(_))));

        let mut v = Vocabulary::default();
        v.timestamps = v.timestamps.start..v.timestamps.start;
        assert!(v.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let v: Vocabulary = serde_json::from_str(r#"{"space": 256}"#).unwrap();
        assert_eq!(v.space, 256);
        assert_eq!(v.end_of_text, 50_257);
    }
}
