//! Whisper-compatible log-mel spectrogram.
//!
//! Per frame: periodic Hann window → FFT (size = window) → power spectrum →
//! Slaney mel filter bank → `log10(max(x, 1e-10))` → floor at `frame_max - 8`
//! → `(v + 4) / 4`.
//!
//! Whisper clamps against the *global* maximum of a 30 s window. Here the
//! dynamic-range floor is applied per frame so a frame depends only on the
//! samples under its window, which keeps streamed frames identical no matter
//! how the audio was chunked.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::config::FrontendConfig;
use crate::error::{HarkError, Result};

use super::{Padding, SpectralTransform};

const LOG_FLOOR: f32 = 1e-10;
const DYNAMIC_RANGE: f32 = 8.0;

pub struct LogMelSpectrogram {
    n_mels: usize,
    window_len: usize,
    hop_len: usize,
    /// `[n_mels][window/2 + 1]` triangular filters.
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for LogMelSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMelSpectrogram")
            .field("n_mels", &self.n_mels)
            .field("window_len", &self.window_len)
            .field("hop_len", &self.hop_len)
            .finish()
    }
}

impl LogMelSpectrogram {
    pub fn new(config: &FrontendConfig) -> Result<Self> {
        config.validate()?;

        let fft_size = config.window_len;
        let mel_filters = build_mel_filters(
            fft_size,
            config.sample_rate,
            config.n_mels,
            0.0,
            config.sample_rate as f32 / 2.0,
        );
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Ok(Self {
            n_mels: config.n_mels,
            window_len: config.window_len,
            hop_len: config.hop_len,
            mel_filters,
            hann_window: build_hann_window(fft_size),
            fft,
        })
    }

    fn frame_into(&self, signal: &[f32], frame: usize, scratch: &mut [Complex<f32>], out: &mut [f32]) {
        let start = (frame * self.hop_len) as isize - (self.window_len / 2) as isize;
        for (i, slot) in scratch.iter_mut().enumerate() {
            let pos = start + i as isize;
            let s = if pos >= 0 {
                signal.get(pos as usize).copied().unwrap_or(0.0)
            } else {
                0.0
            };
            *slot = Complex::new(s * self.hann_window[i], 0.0);
        }
        self.fft.process(scratch);

        let n_freqs = self.window_len / 2 + 1;
        for (m, filter) in self.mel_filters.iter().enumerate() {
            let energy: f32 = filter
                .iter()
                .zip(&scratch[..n_freqs])
                .map(|(w, bin)| w * bin.norm_sqr())
                .sum();
            out[m] = energy.max(LOG_FLOOR).log10();
        }

        let max_val = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        for v in out.iter_mut() {
            *v = ((*v).max(max_val - DYNAMIC_RANGE) + 4.0) / 4.0;
        }
    }
}

impl SpectralTransform for LogMelSpectrogram {
    fn n_mels(&self) -> usize {
        self.n_mels
    }

    fn window_len(&self) -> usize {
        self.window_len
    }

    fn hop_len(&self) -> usize {
        self.hop_len
    }

    fn extract(&self, signal: &[f32], padding: Padding) -> Result<Array2<f32>> {
        if let Some(pos) = signal.iter().position(|s| !s.is_finite()) {
            return Err(HarkError::Features(format!(
                "non-finite sample at offset {pos}"
            )));
        }

        let n_frames = self.frame_count(signal.len(), padding);
        let mut mel = Array2::<f32>::zeros((n_frames, self.n_mels));
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.window_len];
        let mut row = vec![0f32; self.n_mels];

        for frame in 0..n_frames {
            self.frame_into(signal, frame, &mut scratch, &mut row);
            for (dst, &v) in mel.row_mut(frame).iter_mut().zip(&row) {
                *dst = v;
            }
        }
        Ok(mel)
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
            let enorm = 2.0 / (upper - lower).max(LOG_FLOOR);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / (center - lower).max(LOG_FLOOR)
                    } else if freq > center && freq <= upper {
                        (upper - freq) / (upper - center).max(LOG_FLOOR)
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const MEL_F_SP: f32 = 200.0 / 3.0;
const MEL_MIN_LOG_HZ: f32 = 1_000.0;
const MEL_MIN_LOG_MEL: f32 = MEL_MIN_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f32 {
    6.4_f32.ln() / 27.0
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    if hz >= MEL_MIN_LOG_HZ {
        MEL_MIN_LOG_MEL + (hz / MEL_MIN_LOG_HZ).ln() / mel_log_step()
    } else {
        hz / MEL_F_SP
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    if mel >= MEL_MIN_LOG_MEL {
        MEL_MIN_LOG_HZ * (mel_log_step() * (mel - MEL_MIN_LOG_MEL)).exp()
    } else {
        mel * MEL_F_SP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frontend() -> LogMelSpectrogram {
        LogMelSpectrogram::new(&FrontendConfig::default()).expect("default frontend")
    }

    fn tone(n: usize, hz: f32) -> Vec<f32> {
        (0..n)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * hz * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn silence_maps_to_pad_value() {
        let mel = frontend();
        let frames = mel.extract(&vec![0.0; 1_600], Padding::None).unwrap();
        assert_eq!(frames.dim(), (9, 128));
        for &v in frames.iter() {
            assert_relative_eq!(v, mel.pad_value(), epsilon = 1e-6);
        }
    }

    #[test]
    fn end_of_stream_adds_trailing_frames() {
        let mel = frontend();
        let signal = tone(1_000, 440.0);
        let finalized = mel.extract(&signal, Padding::None).unwrap();
        let padded = mel.extract(&signal, Padding::EndOfStream).unwrap();
        assert_eq!(finalized.nrows(), 6);
        assert_eq!(padded.nrows(), 7);
        // Finalized frames never depend on the padding mode.
        for r in 0..finalized.nrows() {
            assert_eq!(finalized.row(r), padded.row(r));
        }
    }

    #[test]
    fn frames_depend_only_on_their_window() {
        let mel = frontend();
        let signal = tone(4_000, 880.0);
        let full = mel.extract(&signal, Padding::None).unwrap();
        // Frame 5 is centred on sample 800; re-extract starting two frames earlier.
        let shifted = mel.extract(&signal[480..], Padding::None).unwrap();
        assert_eq!(full.row(5), shifted.row(2));
    }

    #[test]
    fn tone_energy_peaks_in_low_mel_bins() {
        let mel = frontend();
        let frames = mel.extract(&tone(3_200, 300.0), Padding::None).unwrap();
        let row = frames.row(10);
        let peak = row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert!(peak.0 < 20, "300 Hz should land in a low mel bin, got {}", peak.0);
        assert!(row.iter().all(|&v| v >= peak.1 - 2.0 - 1e-6));
    }

    #[test]
    fn rejects_non_finite_samples() {
        let mel = frontend();
        let mut signal = vec![0.0; 800];
        signal[17] = f32::NAN;
        assert!(matches!(
            mel.extract(&signal, Padding::None),
            Err(HarkError::Features(_))
        ));
    }

    #[test]
    fn slaney_scale_round_trips() {
        for hz in [0.0, 500.0, 1_000.0, 4_000.0, 8_000.0] {
            assert_relative_eq!(mel_to_hz_slaney(hz_to_mel_slaney(hz)), hz, max_relative = 1e-4);
        }
    }
}
