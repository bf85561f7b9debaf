use thiserror::Error;

use crate::inference::RequestId;

/// All errors produced by hark-core.
#[derive(Debug, Error)]
pub enum HarkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("feature extraction error: {0}")]
    Features(String),

    #[error("cannot consume {requested} frames — only {available} buffered")]
    ConsumeOutOfRange { requested: usize, available: usize },

    #[error("ring buffer is full — pipeline cannot keep up")]
    RingBufferFull,

    #[error("a stream is already running")]
    AlreadyRunning,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("unknown request id: {0}")]
    UnknownRequest(RequestId),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("audio file error: {0}")]
    Audio(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarkError>;
