//! Pipeline workers.
//!
//! One module per concern — audio capture, wake word, VAD, ASR, TTS —
//! each implementing [`crate::module::Module`] and talking to the rest of
//! the system only through bus events. None of them calls another worker
//! directly.

pub mod asr;
pub mod audio;
pub mod tts;
pub mod vad;
pub mod wakeword;

pub use asr::AsrWorker;
pub use audio::AudioWorker;
pub use tts::TtsWorker;
pub use vad::VadWorker;
pub use wakeword::WakeWordWorker;
