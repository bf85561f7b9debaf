use std::f32::consts::PI;
use std::sync::Arc;

use hark_core::audio::read_wav_mono;
use hark_core::features::{FeatureBuffer, LogMelSpectrogram};
use hark_core::{
    EngineStatus, HarkConfig, HarkEngine, StubEngine, TokenId, TranscribeOptions, TranscriptEvent,
    WhisperTokenizer,
};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::TryRecvError;

const WORDS: [&str; 10] = ["Ġ", "hello", "world", "the", "cat", "sat", "on", "a", "mat", "<unk>"];

/// Word-level Whisper-shaped tokenizer: text 0..10, end-of-text 10,
/// start-of-transcript 11, en/de/fr 12..15, translate 15, transcribe 16,
/// start-of-prev 17, no-timestamps 18, 51 timestamps from 19.
fn mini_tokenizer() -> WhisperTokenizer {
    let mut tokens: Vec<String> = WORDS.iter().map(|w| w.to_string()).collect();
    for special in [
        "<|endoftext|>",
        "<|startoftranscript|>",
        "<|en|>",
        "<|de|>",
        "<|fr|>",
        "<|translate|>",
        "<|transcribe|>",
        "<|startofprev|>",
        "<|notimestamps|>",
    ] {
        tokens.push(special.to_string());
    }
    for i in 0..51 {
        tokens.push(format!("<|{:.2}|>", i as f32 * 0.02));
    }

    let vocab: serde_json::Map<String, Value> = tokens
        .iter()
        .enumerate()
        .map(|(id, t)| (t.clone(), json!(id)))
        .collect();
    let added: Vec<Value> = tokens
        .iter()
        .enumerate()
        .skip(WORDS.len())
        .map(|(id, t)| {
            json!({
                "id": id, "content": t, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();
    let json = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    WhisperTokenizer::from_json(&json.to_string()).expect("mini tokenizer")
}

/// Detection prefers `en`; each window decodes `<|0.00|> the cat <|0.50|>`.
fn scripted(history: &[TokenId]) -> Vec<f32> {
    let mut row = vec![-4.0; 70];
    match history.iter().rposition(|&t| t == 16) {
        None => row[12] = 6.0,
        Some(p) => {
            let next = [19, 3, 4, 44, 10].get(history.len() - p - 1).copied().unwrap_or(10);
            row[next as usize] = 6.0;
        }
    }
    row
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tone(samples: usize) -> Vec<f32> {
    (0..samples)
        .map(|i| 0.3 * (2.0 * PI * 440.0 * i as f32 / 16_000.0).sin())
        .collect()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<TranscriptEvent>) -> Vec<TranscriptEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wav_file_streams_to_timed_transcript() {
    init_tracing();

    let tokenizer = Arc::new(mini_tokenizer());
    let mut config = HarkConfig {
        vocabulary: tokenizer.vocabulary().clone(),
        ..HarkConfig::default()
    };
    // One-second windows.
    config.frontend.chunk_frames = 100;

    let path = std::env::temp_dir().join(format!("hark-stream-{}.wav", std::process::id()));
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for s in tone(40_000) {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    let audio = read_wav_mono(&path, 16_000).unwrap();
    std::fs::remove_file(&path).ok();

    let engine = HarkEngine::new(config, |c| Ok(StubEngine::new(c, scripted))).unwrap();
    let mut transcripts = engine.subscribe_transcripts();
    let mut stream = engine
        .start_log_mel_stream(tokenizer.clone(), TranscribeOptions::default())
        .unwrap();

    for piece in [&audio[..1_000], &audio[1_000..8_000], &audio[8_000..]] {
        stream.push(piece).unwrap();
    }
    stream.finish().await.expect("stream finishes cleanly");
    assert_eq!(engine.status(), EngineStatus::Stopped);

    // 40 000 samples → 250 frames: two full windows and one of 50 frames.
    let events = drain(&mut transcripts);
    assert_eq!(events.len(), 3);
    for (i, ev) in events.iter().enumerate() {
        assert_eq!(ev.language.as_deref(), Some("en"));
        assert_eq!(ev.segments.len(), 1);
        let seg = &ev.segments[0];
        assert_eq!(seg.text, "the cat");
        assert!((seg.start_secs - i as f64).abs() < 1e-6, "start {}", seg.start_secs);
        assert!((seg.end_secs - (i as f64 + 0.5)).abs() < 1e-6, "end {}", seg.end_secs);
        assert!(seg.avg_log_prob <= 0.0);
    }

    let snap = engine.pipeline_diagnostics_snapshot();
    assert_eq!(snap.samples_in, 40_000);
    assert_eq!(snap.language_detections, 1);
    assert_eq!(snap.frames_consumed, 250);
    assert!(engine.orchestrator().registry().is_empty());
}

#[test]
fn log_mel_frames_do_not_depend_on_chunking() {
    init_tracing();
    let config = HarkConfig::default();
    let audio = tone(14_400);

    let mut whole = FeatureBuffer::new(LogMelSpectrogram::new(&config.frontend).unwrap()).unwrap();
    whole.append(&audio).unwrap();

    let mut pieces = FeatureBuffer::new(LogMelSpectrogram::new(&config.frontend).unwrap()).unwrap();
    for range in [0..400, 400..4_400, 4_400..14_400] {
        pieces.append(&audio[range]).unwrap();
    }

    assert_eq!(whole.len(), 89);
    assert_eq!(pieces.len(), 89);
    let a = whole.get_features(89).unwrap();
    let b = pieces.get_features(89).unwrap();
    let max_diff = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff < 1e-6, "max diff {max_diff}");

    // End of stream adds the frames centred in the last half window.
    whole.finish().unwrap();
    assert_eq!(whole.len(), 90);
}
