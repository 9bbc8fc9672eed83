//! Engine adapter traits consumed by the pipeline workers.
//!
//! Concrete wake-word/VAD/ASR/TTS backends are swappable behind these
//! traits; the workers never know which one is plugged in. The built-in
//! implementations (`energy_vad`, `stub`) exist so the full pipeline runs
//! end-to-end without any model files.
//!
//! Implementors may be stateful (cooldowns, segment buffers, decoder
//! caches). Each engine instance is owned by exactly one worker and all
//! calls arrive serialized.

pub mod energy_vad;
pub mod stub;

pub use energy_vad::SegmentingVad;
pub use stub::{EchoAsr, EnergyWakeWord, TracingTts};

use crate::error::Result;

/// A wake-word hit above the engine's threshold.
#[derive(Debug, Clone)]
pub struct WakeDetection {
    pub keyword: String,
    pub confidence: f32,
}

/// Wake-word detection over mono f32 PCM in [-1, 1].
pub trait WakeWordEngine: Send {
    /// Feed one frame; `Some` when the wake word fired. Cooldown after a
    /// detection is the engine's own business.
    fn detect(&mut self, pcm: &[f32]) -> Option<WakeDetection>;

    /// Clear internal state (cooldowns, score accumulators).
    fn reset(&mut self);
}

/// Segment-level edge reported by a VAD engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSegmentEdge {
    SpeechStart,
    SpeechEnd,
}

/// Outcome of feeding one fixed-size frame to the VAD.
#[derive(Debug, Clone, Default)]
pub struct VadFrameOutcome {
    pub is_speech: bool,
    /// Present only on a rising or falling segment edge.
    pub edge: Option<VadSegmentEdge>,
    /// Assembled segment PCM, present on `SpeechEnd` only.
    pub audio: Option<Vec<i16>>,
    /// Segment duration, present on `SpeechEnd` only.
    pub duration_ms: u32,
}

/// Voice-activity detection over mono i16 PCM frames of a fixed size.
pub trait VadEngine: Send {
    fn process_frame(&mut self, frame: &[i16]) -> VadFrameOutcome;

    /// Drop any in-progress segment and counters.
    fn reset(&mut self);

    /// Arm the post-wake suppression window so the tail of the wake phrase
    /// does not register as speech.
    fn on_wakeword_detected(&mut self);
}

/// A completed recognition result.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

/// Speech recognition over an assembled utterance.
pub trait AsrEngine: Send {
    /// Blocking recognition; callers run this off the bus thread.
    fn recognize(&mut self, pcm: &[i16], sample_rate: u32) -> Result<Recognition>;
}

/// Text-to-speech playback.
pub trait TtsEngine: Send {
    /// Blocking synthesis + playback of one utterance.
    fn speak(&mut self, text: &str) -> Result<()>;
}
