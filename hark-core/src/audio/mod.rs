//! WAV input.
//!
//! Decodes a WAV file into mono `f32` samples in `[-1, 1]`, averaging
//! interleaved channels. The frontend works at one fixed sample rate, so a
//! file at any other rate is rejected rather than resampled.

use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::error::{HarkError, Result};

/// Read a WAV file as mono samples, checking it was recorded at
/// `expected_rate` Hz.
///
/// # Errors
/// `HarkError::Audio` for unreadable files, unsupported encodings or a
/// sample-rate mismatch.
pub fn read_wav_mono(path: impl AsRef<Path>, expected_rate: u32) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)
        .map_err(|e| HarkError::Audio(format!("{}: {e}", path.display())))?;
    let samples = decode_mono(reader, expected_rate)?;
    info!(
        path = %path.display(),
        samples = samples.len(),
        seconds = samples.len() as f64 / f64::from(expected_rate),
        "wav loaded"
    );
    Ok(samples)
}

/// `read_wav_mono` over any byte source.
pub fn read_wav_mono_from<R: Read>(source: R, expected_rate: u32) -> Result<Vec<f32>> {
    let reader = hound::WavReader::new(source).map_err(|e| HarkError::Audio(e.to_string()))?;
    decode_mono(reader, expected_rate)
}

fn decode_mono<R: Read>(mut reader: hound::WavReader<R>, expected_rate: u32) -> Result<Vec<f32>> {
    let spec = reader.spec();
    if spec.sample_rate != expected_rate {
        return Err(HarkError::Audio(format!(
            "expected {expected_rate} Hz audio, got {} Hz",
            spec.sample_rate
        )));
    }
    let channels = usize::from(spec.channels.max(1));
    let audio_err = |e: hound::Error| HarkError::Audio(e.to_string());

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(audio_err)?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / f32::from(i16::MAX)))
            .collect::<std::result::Result<_, _>>()
            .map_err(audio_err)?,
        hound::SampleFormat::Int => {
            let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<_, _>>()
                .map_err(audio_err)?
        }
    };

    if channels == 1 {
        return Ok(interleaved);
    }
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}
