//! `HarkEngine`: top-level handle.
//!
//! ## Lifecycle
//!
//! ```text
//! HarkEngine::new(config, build_engine)
//!     ├─► orchestrator()          → one-shot detect / transcribe requests
//!     └─► start_stream()          → pipeline spawned, status = Streaming
//!             ├─► push()          → samples into the ring buffer
//!             └─► finish().await  → flush remainder, status = Stopped
//! ```
//!
//! One stream at a time: `start_stream()` while a stream is running returns
//! `HarkError::AlreadyRunning`. Dropping a `StreamHandle` without `finish()`
//! still stops the pipeline; the remainder is flushed in the background.
//!
//! ## Threading
//!
//! The pipeline blocks on inference responses, so it runs in
//! `tokio::task::spawn_blocking` and `start_stream()` must be called from
//! within a Tokio runtime.

pub mod orchestrator;
pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    buffering::{create_audio_ring, AudioProducer, Producer},
    config::HarkConfig,
    decode::{DecodeConstraints, RequestRegistry},
    error::{HarkError, Result},
    features::{FeatureBuffer, LogMelSpectrogram, SpectralTransform},
    inference::{EngineHandle, InferenceEngine},
    ipc::events::{EngineStatus, EngineStatusEvent, TranscriptEvent},
    transcript::TokenDecoder,
};

pub use orchestrator::{Orchestrator, TranscribeOptions, TranscribeResponse};

/// Broadcast channel capacity: 256 transcript events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// The top-level engine handle.
///
/// `HarkEngine` is `Send + Sync`; all fields use interior mutability.
pub struct HarkEngine {
    orchestrator: Orchestrator,
    /// `true` from `start_stream()` until the pipeline task returns.
    active: Arc<AtomicBool>,
    /// Canonical status (written atomically via Mutex, read from commands).
    status: Arc<Mutex<EngineStatus>>,
    /// Broadcast sender for transcript events.
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    /// Broadcast sender for status events.
    status_tx: broadcast::Sender<EngineStatusEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    /// Shared pipeline diagnostics counters.
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl HarkEngine {
    /// Validate `config`, create the request registry and constraint engine,
    /// and bind the constraints to the engine built by `build_engine`.
    ///
    /// # Errors
    /// `HarkError::Config` for an invalid configuration; any error returned
    /// by `build_engine`.
    pub fn new<E, F>(config: HarkConfig, build_engine: F) -> Result<Self>
    where
        E: InferenceEngine,
        F: FnOnce(Arc<DecodeConstraints>) -> Result<E>,
    {
        config.validate()?;

        let registry = Arc::new(RequestRegistry::new());
        let constraints = Arc::new(DecodeConstraints::new(
            config.vocabulary.clone(),
            Arc::clone(&registry),
        ));
        let engine = EngineHandle::new(build_engine(Arc::clone(&constraints))?);
        info!(
            n_mels = config.frontend.n_mels,
            chunk_frames = config.frontend.chunk_frames,
            vocab_rows = config.vocabulary.row_len(),
            "hark engine ready"
        );

        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            orchestrator: Orchestrator::new(config, engine, registry, constraints),
            active: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            transcript_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
        })
    }

    /// Request-level access: language detection and transcription.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &HarkConfig {
        self.orchestrator.config()
    }

    /// Start a stream over `features`, which may already hold audio.
    ///
    /// # Errors
    /// - `HarkError::AlreadyRunning` if a stream is active.
    pub fn start_stream<T>(
        &self,
        features: FeatureBuffer<T>,
        decoder: Arc<dyn TokenDecoder>,
        options: TranscribeOptions,
    ) -> Result<StreamHandle>
    where
        T: SpectralTransform + 'static,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HarkError::AlreadyRunning);
        }
        self.diagnostics.reset();

        // Per-stream stop flag: a finishing pipeline never sees the next
        // stream's flag.
        let running = Arc::new(AtomicBool::new(true));
        let (producer, consumer) = create_audio_ring();
        let ctx = pipeline::PipelineContext {
            orchestrator: self.orchestrator.clone(),
            features,
            decoder,
            options,
            consumer,
            running: Arc::clone(&running),
            transcript_tx: self.transcript_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let active = Arc::clone(&self.active);
        let task = tokio::task::spawn_blocking(move || {
            let result = pipeline::run(ctx);
            active.store(false, Ordering::SeqCst);
            result
        });
        info!("stream started");
        Ok(StreamHandle {
            producer,
            running,
            task: Some(task),
        })
    }

    /// `start_stream` with the log-mel frontend described by the config.
    pub fn start_log_mel_stream(
        &self,
        decoder: Arc<dyn TokenDecoder>,
        options: TranscribeOptions,
    ) -> Result<StreamHandle> {
        let transform = LogMelSpectrogram::new(&self.config().frontend)?;
        self.start_stream(FeatureBuffer::new(transform)?, decoder, options)
    }

    /// Whether a stream pipeline is active.
    pub fn is_streaming(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Subscribe to live transcript events.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

/// Producer side of a running stream.
pub struct StreamHandle {
    producer: AudioProducer,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl StreamHandle {
    /// Queue samples for the pipeline.
    ///
    /// # Errors
    /// `HarkError::RingBufferFull` when the pipeline has fallen too far
    /// behind; samples that did fit are kept.
    pub fn push(&mut self, samples: &[f32]) -> Result<()> {
        let pushed = self.producer.push_slice(samples);
        if pushed < samples.len() {
            return Err(HarkError::RingBufferFull);
        }
        Ok(())
    }

    /// End the stream, wait for the remainder to be transcribed and return
    /// the pipeline's result.
    pub async fn finish(mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("stream finish requested");
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await
            .map_err(|e| HarkError::Other(anyhow::anyhow!("pipeline task died unexpectedly: {e}")))?
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.running.store(false, Ordering::SeqCst);
        }
    }
}
