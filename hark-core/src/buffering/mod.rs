//! Lock-free SPSC ring buffer for audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>`, whose `push_slice` never blocks, so a
//! real-time audio callback can feed a stream directly.

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the caller feeding samples (`StreamHandle`).
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the pipeline thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^22 = 4 194 304 f32 samples ≈ 262 s at 16 kHz.
/// Covers several encoder windows while a slow transcription runs.
pub const RING_CAPACITY: usize = 1 << 22;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
