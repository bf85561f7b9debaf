//! Blocking streaming loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> (one chunk per iteration)
//! 2. FeatureBuffer::append → finalized log-mel frames
//! 3. While a full window (chunk_frames) is buffered:
//!    a. Detect the language once (unless fixed by options)
//!    b. Prompt = [start_of_prev, carried…] + [SOT, language, transcribe]
//!    c. Transcribe; keep the best sequence-final response
//!    d. Split into timed segments, consume the covered frames
//!    e. Broadcast TranscriptEvent
//! 4. On stop: drain the ring, finish the buffer, transcribe the remainder
//!    as padded windows
//! ```
//!
//! Runs on a dedicated blocking thread; every inference call blocks on
//! `Orchestrator::await_*`.

use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffering::{AudioConsumer, Consumer},
    engine::orchestrator::{Orchestrator, TranscribeOptions, TranscribeResponse},
    error::{HarkError, Result},
    features::{FeatureBuffer, SpectralTransform},
    inference::RequestId,
    ipc::events::{EngineStatus, EngineStatusEvent, TranscriptEvent, TranscriptSegment},
    transcript::{split_segments, TokenDecoder},
    vocab::{TokenId, Vocabulary, FRAMES_PER_TIMESTAMP},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub language_detections: AtomicUsize,
    pub windows_transcribed: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub segments_emitted: AtomicUsize,
    pub frames_consumed: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.language_detections.store(0, Ordering::Relaxed);
        self.windows_transcribed.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.segments_emitted.store(0, Ordering::Relaxed);
        self.frames_consumed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            language_detections: self.language_detections.load(Ordering::Relaxed),
            windows_transcribed: self.windows_transcribed.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            segments_emitted: self.segments_emitted.load(Ordering::Relaxed),
            frames_consumed: self.frames_consumed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub language_detections: usize,
    pub windows_transcribed: usize,
    pub inference_errors: usize,
    pub segments_emitted: usize,
    pub frames_consumed: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext<T> {
    pub orchestrator: Orchestrator,
    pub features: FeatureBuffer<T>,
    pub decoder: Arc<dyn TokenDecoder>,
    pub options: TranscribeOptions,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub transcript_tx: broadcast::Sender<TranscriptEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Samples drained from the ring buffer per iteration (100 ms at 16 kHz).
const DRAIN_CHUNK: usize = 1_600;

/// Minimum sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Decoding state carried from one window to the next.
struct StreamState {
    language: Option<TokenId>,
    /// Previous output fed back as prompt context.
    carried: Vec<TokenId>,
    next_segment_id: u64,
}

/// Run the blocking pipeline until `ctx.running` becomes false and every
/// buffered sample has been transcribed.
///
/// # Errors
/// The first frontend, inference or decode failure; the stream is aborted and
/// an `EngineStatus::Error` event is broadcast.
pub fn run<T: SpectralTransform>(mut ctx: PipelineContext<T>) -> Result<()> {
    let _span = info_span!("pipeline").entered();
    info!(
        chunk_frames = ctx.orchestrator.config().frontend.chunk_frames,
        fixed_language = ?ctx.options.language,
        "pipeline started"
    );
    set_status(&ctx, EngineStatus::Streaming, None);

    let mut state = StreamState {
        language: ctx.options.language,
        carried: ctx.options.initial_prompt.clone(),
        next_segment_id: 0,
    };

    match stream(&mut ctx, &mut state) {
        Ok(()) => {
            let snap = ctx.diagnostics.snapshot();
            info!(
                samples_in = snap.samples_in,
                language_detections = snap.language_detections,
                windows_transcribed = snap.windows_transcribed,
                segments_emitted = snap.segments_emitted,
                frames_consumed = snap.frames_consumed,
                "pipeline stopped — diagnostics"
            );
            set_status(&ctx, EngineStatus::Stopped, None);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "pipeline aborted");
            ctx.running.store(false, Ordering::SeqCst);
            set_status(&ctx, EngineStatus::Error, Some(e.to_string()));
            Err(e)
        }
    }
}

fn stream<T: SpectralTransform>(ctx: &mut PipelineContext<T>, state: &mut StreamState) -> Result<()> {
    let chunk_frames = ctx.orchestrator.config().frontend.chunk_frames;
    let mut raw = vec![0f32; DRAIN_CHUNK];

    loop {
        // Read the flag before draining: a producer stores `false` only after
        // its last push, so an empty ring seen afterwards is really empty.
        let running = ctx.running.load(Ordering::SeqCst);

        // ── 1. Drain ring buffer ──────────────────────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);
        if n > 0 {
            ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);
            ctx.features.append(&raw[..n])?;
        }

        // ── 2. Transcribe every full window ───────────────────────────────
        while ctx.features.len() >= chunk_frames {
            transcribe_window(ctx, state)?;
        }

        if n == 0 {
            if !running {
                break;
            }
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
        }
    }

    // ── 3. End of stream: flush the remainder ─────────────────────────────
    set_status(ctx, EngineStatus::Flushing, None);
    ctx.features.finish()?;
    debug!(remaining_frames = ctx.features.len(), "flushing final windows");
    while ctx.features.len() > 0 {
        transcribe_window(ctx, state)?;
    }
    Ok(())
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("HARK_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

/// Transcribe the first window of buffered frames (padded when fewer are
/// left) and consume what its segments cover, at least one frame.
fn transcribe_window<T: SpectralTransform>(
    ctx: &mut PipelineContext<T>,
    state: &mut StreamState,
) -> Result<()> {
    let config = ctx.orchestrator.config();
    let window = config.frontend.chunk_frames;
    let frame_seconds = ctx.features.transform().hop_len() as f64 / config.frontend.sample_rate as f64;
    let max_prompt_tokens = config.decode.max_prompt_tokens;

    let available = ctx.features.len().min(window);
    let features = ctx.features.get_features(window)?;

    let language = match state.language {
        Some(language) => language,
        None => {
            let id = ctx.orchestrator.enqueue_detect_language_request(features.clone())?;
            let language = ctx
                .orchestrator
                .await_detect_language_response(id)
                .inspect_err(|_| count_error(ctx))?;
            ctx.diagnostics.language_detections.fetch_add(1, Ordering::Relaxed);
            info!(
                language,
                code = ?ctx.decoder.language_code(language),
                "language detected"
            );
            state.language = Some(language);
            language
        }
    };

    let prompt = ctx.orchestrator.build_prompt(Some(language), &state.carried);
    let id = ctx
        .orchestrator
        .enqueue_transcribe_request(features, prompt, &ctx.options, false)?;
    let best = await_best(&ctx.orchestrator, id).inspect_err(|_| count_error(ctx))?;
    ctx.diagnostics.windows_transcribed.fetch_add(1, Ordering::Relaxed);

    let split = split_segments(&best.tokens, ctx.orchestrator.vocabulary(), window);
    let window_start = ctx.features.offset();
    let mut segments = Vec::with_capacity(split.segments.len());
    for segment in &split.segments {
        if ctx.options.condition_on_previous_text {
            state.carried.extend_from_slice(&segment.tokens);
        }
        let text = ctx.decoder.decode_text(&segment.tokens)?;
        if text.is_empty() {
            continue;
        }
        state.next_segment_id += 1;
        let at = |seconds: f32| (window_start + window_offset_frames(seconds)) as f64 * frame_seconds;
        segments.push(TranscriptSegment {
            id: format!("seg-{}", state.next_segment_id),
            start_secs: at(segment.start),
            end_secs: at(segment.end),
            text,
            avg_log_prob: best.avg_log_prob,
        });
    }
    if state.carried.len() > max_prompt_tokens {
        let excess = state.carried.len() - max_prompt_tokens;
        state.carried.drain(..excess);
    }

    // Always move forward, never past the real frames.
    let consumed = split.consumed_frames.clamp(1, available);
    ctx.features.consume(consumed)?;
    ctx.diagnostics.frames_consumed.fetch_add(consumed, Ordering::Relaxed);
    debug!(
        request = %id,
        window_start,
        consumed,
        segments = segments.len(),
        avg_log_prob = best.avg_log_prob,
        "window transcribed"
    );

    if segments.is_empty() {
        return Ok(());
    }
    ctx.diagnostics
        .segments_emitted
        .fetch_add(segments.len(), Ordering::Relaxed);
    let event = TranscriptEvent {
        seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
        language: ctx.decoder.language_code(language),
        segments,
    };
    if ctx.transcript_tx.send(event).is_err() {
        debug!("no transcript subscribers");
    }
    Ok(())
}

/// Collect responses until the final one; the sequence-final response with
/// the highest `avg_log_prob` wins.
fn await_best(orchestrator: &Orchestrator, id: RequestId) -> Result<TranscribeResponse> {
    let mut best: Option<TranscribeResponse> = None;
    loop {
        let response = orchestrator.await_transcribe_response(id)?;
        let is_final = response.is_final;
        let better = best
            .as_ref()
            .map_or(true, |b| response.avg_log_prob > b.avg_log_prob);
        if response.is_sequence_final && better {
            best = Some(response);
        } else if is_final && best.is_none() {
            warn!(request = %id, "final response without a finished sequence");
            best = Some(response);
        }
        if is_final {
            return best.ok_or_else(|| HarkError::Inference(format!("request {id} returned no response")));
        }
    }
}

/// Window-relative timestamp seconds → feature frames.
fn window_offset_frames(seconds: f32) -> usize {
    Vocabulary::timestamp_steps(seconds) as usize * FRAMES_PER_TIMESTAMP
}

fn count_error<T>(ctx: &PipelineContext<T>) {
    ctx.diagnostics.inference_errors.fetch_add(1, Ordering::Relaxed);
}

fn set_status<T>(ctx: &PipelineContext<T>, status: EngineStatus, detail: Option<String>) {
    *ctx.status.lock() = status;
    let _ = ctx.status_tx.send(EngineStatusEvent { status, detail });
}
