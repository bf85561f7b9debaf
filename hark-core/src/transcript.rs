//! Splitting one window's generated tokens into timed segments.
//!
//! ```text
//! <|0.00|> the cat <|1.20|><|1.20|> sat on <|2.40|><|2.40|> a mat …
//! └──────── segment ───────┘└────── segment ──────┘└─ unfinished ─┘
//!                                                  ▲ consume up to here
//! ```
//!
//! A pair of consecutive timestamps closes a segment. A sequence that ends
//! in a single timestamp closed its last segment at the end of the audio, so
//! the whole window is consumed. Otherwise the trailing unfinished text is
//! dropped and the window is consumed only up to the last closing timestamp,
//! so the next window re-transcribes it with full context.

use crate::error::Result;
use crate::vocab::{TokenId, Vocabulary, FRAMES_PER_TIMESTAMP};

/// Turns text tokens back into a string.
pub trait TokenDecoder: Send + Sync {
    fn decode_text(&self, tokens: &[TokenId]) -> Result<String>;

    /// ISO code of a language tag, when the decoder knows it.
    fn language_code(&self, _token: TokenId) -> Option<String> {
        None
    }
}

/// Tokens of one segment with window-relative times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedTokens {
    pub start: f32,
    pub end: f32,
    /// Segment tokens, including its bounding timestamps.
    pub tokens: Vec<TokenId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSplit {
    pub segments: Vec<TimedTokens>,
    /// Feature frames of the window covered by `segments`.
    pub consumed_frames: usize,
}

/// Split generated tokens (prompt excluded) of a `window_frames`-long window.
pub fn split_segments(generated: &[TokenId], vocab: &Vocabulary, window_frames: usize) -> WindowSplit {
    let tokens = match generated.iter().position(|&t| t == vocab.end_of_text) {
        Some(eot) => &generated[..eot],
        None => generated,
    };
    let window_seconds = (window_frames / FRAMES_PER_TIMESTAMP) as f32 * crate::vocab::SECONDS_PER_TIMESTAMP;
    let seconds = |t: TokenId| vocab.timestamp_seconds(t).unwrap_or(0.0);

    let n = tokens.len();
    let single_timestamp_ending =
        n >= 2 && !vocab.is_timestamp(tokens[n - 2]) && vocab.is_timestamp(tokens[n - 1]);

    let mut cuts: Vec<usize> = (1..n)
        .filter(|&i| vocab.is_timestamp(tokens[i - 1]) && vocab.is_timestamp(tokens[i]))
        .collect();

    if cuts.is_empty() {
        // No closed segment: everything is one segment spanning the window,
        // or up to the last timestamp when the model emitted one.
        let end = tokens
            .iter()
            .rev()
            .find(|&&t| vocab.is_timestamp(t))
            .filter(|&&t| t != vocab.timestamps.start)
            .map_or(window_seconds, |&t| seconds(t));
        let segments = if tokens.is_empty() {
            Vec::new()
        } else {
            vec![TimedTokens {
                start: 0.0,
                end,
                tokens: tokens.to_vec(),
            }]
        };
        return WindowSplit {
            segments,
            consumed_frames: window_frames,
        };
    }

    if single_timestamp_ending {
        cuts.push(n);
    }

    let mut segments = Vec::with_capacity(cuts.len());
    let mut last = 0;
    for &cut in &cuts {
        let slice = &tokens[last..cut];
        segments.push(TimedTokens {
            start: seconds(slice[0]),
            end: seconds(slice[slice.len() - 1]),
            tokens: slice.to_vec(),
        });
        last = cut;
    }

    let consumed_frames = if single_timestamp_ending {
        window_frames
    } else {
        vocab
            .timestamp_frames(tokens[last - 1])
            .unwrap_or(window_frames)
            .min(window_frames)
    };

    WindowSplit {
        segments,
        consumed_frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vocab() -> Vocabulary {
        Vocabulary {
            space: 0,
            end_of_text: 10,
            start_of_transcript: 11,
            languages: 12..16,
            transcribe: 16,
            start_of_prev: 17,
            no_timestamps: 18,
            timestamps: 19..170,
        }
    }

    const TS: TokenId = 19;

    #[test]
    fn consecutive_timestamps_close_segments_and_trailing_text_is_deferred() {
        let split = split_segments(&[TS, 1, 2, TS + 60, TS + 60, 3, TS + 120, TS + 120, 4, 5], &vocab(), 3_000);
        assert_eq!(split.segments.len(), 2);
        assert_relative_eq!(split.segments[0].start, 0.0);
        assert_relative_eq!(split.segments[0].end, 1.2, epsilon = 1e-5);
        assert_eq!(split.segments[0].tokens, vec![TS, 1, 2, TS + 60]);
        assert_relative_eq!(split.segments[1].start, 1.2, epsilon = 1e-5);
        assert_relative_eq!(split.segments[1].end, 2.4, epsilon = 1e-5);
        assert_eq!(split.consumed_frames, 240);
    }

    #[test]
    fn single_timestamp_ending_consumes_whole_window() {
        let split = split_segments(&[TS, 1, TS + 50, TS + 50, 2, TS + 90, 10], &vocab(), 1_000);
        assert_eq!(split.segments.len(), 2);
        assert_eq!(split.segments[1].tokens, vec![TS + 50, 2, TS + 90]);
        assert_relative_eq!(split.segments[1].end, 1.8, epsilon = 1e-5);
        assert_eq!(split.consumed_frames, 1_000);
    }

    #[test]
    fn lone_segment_without_pair_spans_to_last_timestamp() {
        let split = split_segments(&[TS, 1, 2, TS + 25, 10], &vocab(), 3_000);
        assert_eq!(split.segments.len(), 1);
        assert_relative_eq!(split.segments[0].end, 0.5, epsilon = 1e-5);
        assert_eq!(split.consumed_frames, 3_000);
    }

    #[test]
    fn no_timestamps_spans_whole_window() {
        let split = split_segments(&[1, 2, 3], &vocab(), 3_000);
        assert_eq!(split.segments.len(), 1);
        assert_relative_eq!(split.segments[0].end, 30.0, epsilon = 1e-4);
        assert_eq!(split.consumed_frames, 3_000);
    }

    #[test]
    fn empty_generation_yields_no_segments() {
        let split = split_segments(&[10], &vocab(), 3_000);
        assert!(split.segments.is_empty());
        assert_eq!(split.consumed_frames, 3_000);
    }

    #[test]
    fn consumption_is_capped_at_window() {
        let split = split_segments(&[TS, 1, TS + 140, TS + 140, 2], &vocab(), 100);
        assert_eq!(split.consumed_frames, 100);
    }
}
