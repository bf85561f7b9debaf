//! Masking helpers over one beam's score row.
//!
//! Every range is clamped to the row length, so a short or malformed row
//! degrades to a partial (or no-op) mask instead of a panic.

use std::ops::Range;

use ndarray::ArrayViewMut1;

use crate::vocab::TokenId;

pub struct BeamScores<'a> {
    row: ArrayViewMut1<'a, f32>,
}

impl<'a> BeamScores<'a> {
    pub fn new(row: ArrayViewMut1<'a, f32>) -> Self {
        Self { row }
    }

    fn clamp(&self, range: Range<TokenId>) -> Range<usize> {
        let len = self.row.len();
        let start = (range.start as usize).min(len);
        let end = (range.end as usize).clamp(start, len);
        start..end
    }

    pub fn suppress(&mut self, token: TokenId) {
        if let Some(v) = self.row.get_mut(token as usize) {
            *v = f32::NEG_INFINITY;
        }
    }

    pub fn suppress_range(&mut self, range: Range<TokenId>) {
        let range = self.clamp(range);
        for v in self.row.iter_mut().skip(range.start).take(range.len()) {
            *v = f32::NEG_INFINITY;
        }
    }

    /// Leave `range` as is and suppress everything else. No-op if `range`
    /// does not intersect the row.
    pub fn allow_only(&mut self, range: Range<TokenId>) {
        let range = self.clamp(range);
        if range.is_empty() {
            return;
        }
        for (i, v) in self.row.iter_mut().enumerate() {
            if !range.contains(&i) {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    /// Make `token` the only finite score (`0.0`). No-op if out of range.
    pub fn force(&mut self, token: TokenId) {
        let token = token as usize;
        if token >= self.row.len() {
            return;
        }
        self.row.fill(f32::NEG_INFINITY);
        self.row[token] = 0.0;
    }

    /// `log Σ exp(score)` over `range`; `-inf` when empty or fully masked.
    pub fn logsumexp(&self, range: Range<TokenId>) -> f32 {
        let range = self.clamp(range);
        let slice = self.row.iter().skip(range.start).take(range.len());
        let max = slice.clone().copied().fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            return f32::NEG_INFINITY;
        }
        let sum: f32 = slice.map(|&v| (v - max).exp()).sum();
        max + sum.ln()
    }

    pub fn max(&self, range: Range<TokenId>) -> f32 {
        let range = self.clamp(range);
        self.row
            .iter()
            .skip(range.start)
            .take(range.len())
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn finite_count(&self) -> usize {
        self.row.iter().filter(|v| v.is_finite()).count()
    }
}
