//! Lock-free SPSC ring buffer between the audio callback and the capture
//! worker.
//!
//! `ringbuf::HeapRb<f32>` gives a wait-free `push_slice` that is safe to
//! call from the real-time audio callback.

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half — held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the capture worker thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^21 f32 samples ≈ 43 s at 48 kHz. Generous enough that the worker can
/// stall on a slow consumer without the callback dropping audio.
pub const RING_CAPACITY: usize = 1 << 21;

/// Create a matched producer/consumer pair.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
