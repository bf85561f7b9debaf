//! Causal streaming feature buffer.
//!
//! ```text
//! stream:  ─────────────────────────────────────────────┬──────────────┐
//!                                        finalized frames│ tail samples │
//! frames:  [ consumed ][ buffered ………………………………… ]      │◄ overlap ►│◄ rem ►│
//! ```
//!
//! After every append the buffer keeps `overlap × hop` samples covering the
//! last finalized frames plus the remainder that is not yet a full window.
//! The next extraction re-derives those overlap frames (their left context
//! is gone, so they are discarded) and the first genuinely new frame sees its
//! complete window. Frames are therefore computed exactly once from exactly
//! the samples under their window, independent of chunking.

use ndarray::{s, Array2, Axis};
use tracing::debug;

use crate::config::validate_window;
use crate::error::{HarkError, Result};

use super::{max_overlap_frames, Padding, SpectralTransform};

pub struct FeatureBuffer<T> {
    transform: T,
    /// Buffered, finalized, not-yet-consumed frames: `[time × mel]`.
    frames: Array2<f32>,
    /// Raw samples seeding the next extraction.
    tail: Vec<f32>,
    /// Leading frames of `tail` that are already in `frames` (or consumed).
    overlap_frames: usize,
    max_overlap_frames: usize,
    /// Frames consumed since the stream started.
    consumed: usize,
}

impl<T: SpectralTransform> FeatureBuffer<T> {
    /// # Errors
    /// `HarkError::Config` when the transform reports a non-positive window or
    /// hop, a hop longer than its window, or zero mel bins.
    pub fn new(transform: T) -> Result<Self> {
        let (window, hop, n_mels) = (transform.window_len(), transform.hop_len(), transform.n_mels());
        validate_window(window, hop)?;
        if n_mels == 0 {
            return Err(HarkError::Config("transform reports zero mel bins".into()));
        }

        let max_overlap_frames = max_overlap_frames(window, hop);
        debug!(window, hop, n_mels, max_overlap_frames, "feature buffer created");

        Ok(Self {
            transform,
            frames: Array2::zeros((0, n_mels)),
            tail: Vec::new(),
            overlap_frames: 0,
            max_overlap_frames,
            consumed: 0,
        })
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Append a chunk of samples, finalizing every frame whose window is now
    /// fully known.
    ///
    /// On a transform error the buffer is left exactly as before the call.
    pub fn append(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let before = self.tail.len();
        self.tail.extend_from_slice(samples);

        let hop = self.transform.hop_len();
        let finalized = self.transform.frame_count(self.tail.len(), Padding::None);
        if finalized <= self.overlap_frames {
            return Ok(());
        }

        let extracted = match self.extract_checked(Padding::None, finalized) {
            Ok(e) => e,
            Err(e) => {
                self.tail.truncate(before);
                return Err(e);
            }
        };
        let new_frames = extracted.slice(s![self.overlap_frames..finalized, ..]);
        if let Err(e) = self.frames.append(Axis(0), new_frames) {
            self.tail.truncate(before);
            return Err(HarkError::Features(e.to_string()));
        }

        // Keep `overlap` finalized frames worth of samples so the next new
        // frame has its full left context.
        let overlap = self.max_overlap_frames.min(finalized);
        self.tail.drain(..(finalized - overlap) * hop);
        self.overlap_frames = overlap;
        Ok(())
    }

    /// Exactly `amt` frames: buffered frames first, then end-of-stream frames
    /// from the retained tail, then rows of `pad_value()`.
    ///
    /// Does not mutate the buffer; repeated calls return identical results.
    pub fn get_features(&self, amt: usize) -> Result<Array2<f32>> {
        let buffered = self.frames.nrows();
        if buffered >= amt {
            return Ok(self.frames.slice(s![..amt, ..]).to_owned());
        }

        let mut out = Array2::from_elem((amt, self.transform.n_mels()), self.transform.pad_value());
        out.slice_mut(s![..buffered, ..]).assign(&self.frames);

        let pending = self.pending_frames()?;
        let take = pending.nrows().min(amt - buffered);
        out.slice_mut(s![buffered..buffered + take, ..])
            .assign(&pending.slice(s![..take, ..]));
        Ok(out)
    }

    /// End the stream: materialize the end-of-stream frames into the buffer
    /// and drop the tail. A later `append` starts a fresh stream.
    pub fn finish(&mut self) -> Result<()> {
        let pending = self.pending_frames()?;
        let added = pending.nrows();
        self.frames
            .append(Axis(0), pending.view())
            .map_err(|e| HarkError::Features(e.to_string()))?;
        self.tail.clear();
        self.overlap_frames = 0;
        debug!(added, buffered = self.frames.nrows(), "feature stream finished");
        Ok(())
    }

    /// Drop the first `amt` buffered frames.
    pub fn consume(&mut self, amt: usize) -> Result<()> {
        let available = self.frames.nrows();
        if amt > available {
            return Err(HarkError::ConsumeOutOfRange {
                requested: amt,
                available,
            });
        }
        if amt > 0 {
            self.frames = self.frames.slice(s![amt.., ..]).to_owned();
            self.consumed += amt;
        }
        Ok(())
    }

    /// Buffered (finalized, unconsumed) frame count.
    pub fn len(&self) -> usize {
        self.frames.nrows()
    }

    /// No buffered frames and no tail samples beyond the overlap region.
    pub fn is_empty(&self) -> bool {
        self.frames.nrows() == 0
            && self.tail.len() <= self.overlap_frames * self.transform.hop_len()
    }

    /// Frames consumed since the stream started.
    pub fn offset(&self) -> usize {
        self.consumed
    }

    /// Raw samples currently retained between appends.
    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// End-of-stream frames derivable from the tail that are not yet buffered.
    fn pending_frames(&self) -> Result<Array2<f32>> {
        let n_mels = self.transform.n_mels();
        let total = self.transform.frame_count(self.tail.len(), Padding::EndOfStream);
        if total <= self.overlap_frames {
            return Ok(Array2::zeros((0, n_mels)));
        }
        let extracted = self.extract_checked(Padding::EndOfStream, total)?;
        Ok(extracted.slice(s![self.overlap_frames..total, ..]).to_owned())
    }

    fn extract_checked(&self, padding: Padding, expected: usize) -> Result<Array2<f32>> {
        let extracted = self.transform.extract(&self.tail, padding)?;
        let (rows, cols) = extracted.dim();
        if rows < expected || cols != self.transform.n_mels() {
            return Err(HarkError::Features(format!(
                "transform returned {rows}×{cols}, expected at least {expected}×{}",
                self.transform.n_mels()
            )));
        }
        Ok(extracted)
    }
}
