//! HuggingFace `tokenizer.json` wrapper for Whisper.
//!
//! Resolves the [`Vocabulary`] layout from special-token names so the
//! constraint engine and the tokenizer can never disagree on ids.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{HarkError, Result};
use crate::transcript::TokenDecoder;
use crate::vocab::{TokenId, Vocabulary};

const END_OF_TEXT: &str = "<|endoftext|>";
const START_OF_TRANSCRIPT: &str = "<|startoftranscript|>";
const TRANSLATE: &str = "<|translate|>";
const TRANSCRIBE: &str = "<|transcribe|>";
const START_OF_PREV: &str = "<|startofprev|>";
const NO_TIMESTAMPS: &str = "<|notimestamps|>";
const FIRST_TIMESTAMP: &str = "<|0.00|>";
/// Byte-level BPE spelling of a single space.
const SPACE: &str = "Ġ";

pub struct WhisperTokenizer {
    inner: Tokenizer,
    vocab: Vocabulary,
}

impl std::fmt::Debug for WhisperTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTokenizer")
            .field("vocab", &self.vocab)
            .finish_non_exhaustive()
    }
}

impl WhisperTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading tokenizer from {:?}", path);
        let inner =
            Tokenizer::from_file(path).map_err(|e| HarkError::Tokenizer(e.to_string()))?;
        Self::new(inner)
    }

    /// Build from the contents of a `tokenizer.json`.
    pub fn from_json(json: &str) -> Result<Self> {
        let inner = Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| HarkError::Tokenizer(e.to_string()))?;
        Self::new(inner)
    }

    fn new(inner: Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| HarkError::Tokenizer(format!("missing special token {token}")))
        };

        let start_of_transcript = id(START_OF_TRANSCRIPT)?;
        let transcribe = id(TRANSCRIBE)?;
        // Language tags sit between start-of-transcript and the task tokens.
        let languages_end = inner.token_to_id(TRANSLATE).unwrap_or(transcribe);
        let vocab_size = inner.get_vocab_size(true) as TokenId;

        let vocab = Vocabulary {
            space: id(SPACE)?,
            end_of_text: id(END_OF_TEXT)?,
            start_of_transcript,
            languages: start_of_transcript + 1..languages_end,
            transcribe,
            start_of_prev: id(START_OF_PREV)?,
            no_timestamps: id(NO_TIMESTAMPS)?,
            timestamps: id(FIRST_TIMESTAMP)?..vocab_size,
        };
        vocab.validate()?;

        info!(
            vocab_size,
            languages = vocab.languages.len(),
            timestamps = vocab.timestamps.len(),
            "tokenizer vocabulary resolved"
        );
        Ok(Self { inner, vocab })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Language-tag token for an ISO code such as `"en"`.
    pub fn language_token(&self, code: &str) -> Result<TokenId> {
        self.inner
            .token_to_id(&format!("<|{code}|>"))
            .filter(|&t| self.vocab.is_language(t))
            .ok_or_else(|| HarkError::Tokenizer(format!("unknown language code {code:?}")))
    }

    /// ISO code of a language-tag token.
    pub fn language_code(&self, token: TokenId) -> Option<String> {
        if !self.vocab.is_language(token) {
            return None;
        }
        let raw = self.inner.id_to_token(token)?;
        raw.strip_prefix("<|")
            .and_then(|s| s.strip_suffix("|>"))
            .map(str::to_string)
    }

    /// Timestamp token nearest to `seconds`, if the vocabulary reaches it.
    pub fn timestamp_token(&self, seconds: f32) -> Option<TokenId> {
        let token = self
            .vocab
            .timestamps
            .start
            .checked_add(Vocabulary::timestamp_steps(seconds))?;
        self.vocab.is_timestamp(token).then_some(token)
    }

    /// Encode plain text (no special tokens added).
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| HarkError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TokenDecoder for WhisperTokenizer {
    /// Decode text tokens; control and timestamp tokens are dropped first.
    fn decode_text(&self, tokens: &[TokenId]) -> Result<String> {
        let text: Vec<TokenId> = tokens
            .iter()
            .copied()
            .filter(|&t| self.vocab.is_text(t))
            .collect();
        if text.is_empty() {
            return Ok(String::new());
        }
        let decoded = self
            .inner
            .decode(&text, true)
            .map_err(|e| HarkError::Tokenizer(e.to_string()))?;
        Ok(decoded.trim().to_string())
    }

    fn language_code(&self, token: TokenId) -> Option<String> {
        WhisperTokenizer::language_code(self, token)
    }
}
