//! Built-in placeholder engines.
//!
//! These let the whole pipeline run end-to-end without model files: the
//! wake detector fires on sustained energy, the ASR echoes segment
//! metadata, and TTS "plays" through the log. Production deployments swap
//! in real backends behind the same traits.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{AsrEngine, Recognition, TtsEngine, WakeDetection, WakeWordEngine};
use crate::error::Result;

/// RMS-threshold wake detector with a refractory cooldown.
///
/// Any frame whose RMS clears the threshold counts as "the keyword was
/// spoken". Obviously not a real keyword spotter — it stands in for one.
pub struct EnergyWakeWord {
    keyword: String,
    threshold: f32,
    cooldown: Duration,
    last_detection: Option<Instant>,
}

impl EnergyWakeWord {
    pub fn new(keyword: impl Into<String>, threshold: f32, cooldown: Duration) -> Self {
        Self {
            keyword: keyword.into(),
            threshold,
            cooldown,
            last_detection: None,
        }
    }

    fn rms(pcm: &[f32]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = pcm.iter().map(|s| s * s).sum();
        (sum_sq / pcm.len() as f32).sqrt()
    }
}

impl WakeWordEngine for EnergyWakeWord {
    fn detect(&mut self, pcm: &[f32]) -> Option<WakeDetection> {
        if let Some(last) = self.last_detection {
            if last.elapsed() < self.cooldown {
                return None;
            }
        }

        let rms = Self::rms(pcm);
        if rms < self.threshold {
            return None;
        }

        self.last_detection = Some(Instant::now());
        let confidence = (rms / self.threshold).min(1.0);
        debug!(keyword = %self.keyword, confidence, "wake stub fired");
        Some(WakeDetection {
            keyword: self.keyword.clone(),
            confidence,
        })
    }

    fn reset(&mut self) {
        self.last_detection = None;
    }
}

/// Echo-style recognizer: reports segment metadata instead of words.
pub struct EchoAsr {
    utterances: u32,
}

impl EchoAsr {
    pub fn new() -> Self {
        Self { utterances: 0 }
    }
}

impl Default for EchoAsr {
    fn default() -> Self {
        Self::new()
    }
}

impl AsrEngine for EchoAsr {
    fn recognize(&mut self, pcm: &[i16], sample_rate: u32) -> Result<Recognition> {
        self.utterances += 1;
        let duration_ms = pcm.len() as u64 * 1000 / sample_rate.max(1) as u64;
        Ok(Recognition {
            text: format!("[utterance {} — {} ms of speech]", self.utterances, duration_ms),
            confidence: 1.0,
        })
    }
}

/// TTS that speaks through the log.
pub struct TracingTts;

impl TtsEngine for TracingTts {
    fn speak(&mut self, text: &str) -> Result<()> {
        info!(text, "tts playback");
        Ok(())
    }
}
