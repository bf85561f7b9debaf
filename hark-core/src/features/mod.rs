//! Spectral frontend.
//!
//! ```text
//! samples ──► FeatureBuffer ──(tail ++ chunk)──► SpectralTransform::extract ──► frames [time × mel]
//!                  ▲                                                               │
//!                  └─────────── retained tail (overlap frames × hop + remainder) ◄──┘
//! ```
//!
//! ## Frame geometry
//!
//! Frame `j` of a signal is centred on sample `j * hop` and covers
//! `[j*hop - window/2, j*hop - window/2 + window)`. Positions before the
//! signal start read as silence. A frame is *finalized* once its whole window
//! lies inside the signal; at end of stream every frame whose centre lies
//! inside the signal is produced, reading silence past the end.

pub mod buffer;
pub mod mel;

use ndarray::Array2;

use crate::error::Result;

pub use buffer::FeatureBuffer;
pub use mel::LogMelSpectrogram;

/// Value of a silent frame after log-mel scaling; used to pad short windows.
pub const SILENCE_PAD_VALUE: f32 = -1.5;

/// How to treat the end of the supplied signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Only frames whose window lies entirely inside the signal.
    None,
    /// Final chunk: every frame whose centre lies inside the signal,
    /// reading silence past the end.
    EndOfStream,
}

/// External spectral transform service.
///
/// Must be a pure function of the signal and padding flag: two calls with the
/// same arguments return identical frames. The feature buffer relies on this
/// for chunk-invariance.
pub trait SpectralTransform: Send {
    fn n_mels(&self) -> usize;
    fn window_len(&self) -> usize;
    fn hop_len(&self) -> usize;

    /// Fill value for rows requested beyond the available audio.
    fn pad_value(&self) -> f32 {
        SILENCE_PAD_VALUE
    }

    /// Extract `(time × mel)` frames for `signal`, starting with the frame
    /// centred on `signal[0]`. Exactly `frame_count(signal.len(), padding)`
    /// rows are returned.
    fn extract(&self, signal: &[f32], padding: Padding) -> Result<Array2<f32>>;

    fn frame_count(&self, n_samples: usize, padding: Padding) -> usize {
        match padding {
            Padding::None => finalized_frame_count(n_samples, self.window_len(), self.hop_len()),
            Padding::EndOfStream => end_of_stream_frame_count(n_samples, self.hop_len()),
        }
    }
}

/// Frames whose analysis window is fully covered by `n_samples`.
///
/// Equivalent to `(n + hop - window/2) / hop` for even windows.
pub fn finalized_frame_count(n_samples: usize, window_len: usize, hop_len: usize) -> usize {
    let reach = window_len - window_len / 2;
    if hop_len == 0 || n_samples < reach {
        return 0;
    }
    (n_samples - reach) / hop_len + 1
}

/// Frames whose centre lies inside `n_samples`.
pub fn end_of_stream_frame_count(n_samples: usize, hop_len: usize) -> usize {
    if hop_len == 0 {
        return 0;
    }
    n_samples.div_ceil(hop_len)
}

/// Frames that must be re-derived after each append so the next new frame
/// has its full left context: `ceil((window/2) / hop)`.
pub fn max_overlap_frames(window_len: usize, hop_len: usize) -> usize {
    if hop_len == 0 {
        return 0;
    }
    (window_len / 2).div_ceil(hop_len)
}
