//! Event types broadcast to stream subscribers.
//!
//! | Event | Receiver |
//! |-------|----------|
//! | `TranscriptEvent` | `HarkEngine::subscribe_transcripts` |
//! | `EngineStatusEvent` | `HarkEngine::subscribe_status` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// Emitted once per transcribed window that produced text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Detected (or configured) language code, if known.
    pub language: Option<String>,
    /// Segments closed in this window, in stream order.
    pub segments: Vec<TranscriptSegment>,
}

/// One timed segment of recognised text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    /// Stable ID, unique within one stream.
    pub id: String,
    /// Start on the stream timeline, in seconds.
    pub start_secs: f64,
    /// End on the stream timeline, in seconds.
    pub end_secs: f64,
    pub text: String,
    /// Mean token log-probability of the window's decode.
    pub avg_log_prob: f32,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the stream state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// No stream running.
    Idle,
    /// Accepting audio and transcribing full windows.
    Streaming,
    /// Stream ended; transcribing the remaining audio.
    Flushing,
    /// Stream finished cleanly; a new one may be started.
    Stopped,
    /// Stream aborted by an engine or frontend failure.
    Error,
}
