//! Runtime configuration for the assistant core.
//!
//! Plain serde-derived structs with working defaults. Loading these from a
//! file is the host's concern; the core only consumes the assembled
//! [`AurigaConfig`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agents::AgentProfile;
use crate::state::StateConfig;

/// Audio capture parameters. The pipeline operates on 16 kHz mono s16
/// frames regardless of the device rate; capture resamples to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per published `AUDIO_FRAME_READY` event.
    pub chunk_size: usize,
    /// Preferred input device name; `None` selects the system default.
    pub device_name: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_size: 480,
            device_name: None,
        }
    }
}

/// Voice-activity detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub sample_rate: u32,
    /// VAD frame length in ms (10, 20 or 30).
    pub frame_duration_ms: u32,
    /// Mean-absolute amplitude above which a frame counts as speech,
    /// normalized to [0, 1].
    pub energy_threshold: f32,
    /// Trailing silence needed before a segment is closed.
    pub vad_end_silence_ms: u32,
    /// Audio retained from before the detected speech onset.
    pub pre_speech_buffer_ms: u32,
    /// Segments shorter than this are dropped before publication.
    pub min_speech_duration_ms: u32,
    /// Segments whose mean level stays below this are dropped.
    pub min_volume_threshold: f32,
    /// Suppression window after a wake-word hit, so the wake phrase tail
    /// does not trigger speech.
    pub wakeword_delay_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration_ms: 30,
            energy_threshold: 0.02,
            vad_end_silence_ms: 1_000,
            pre_speech_buffer_ms: 300,
            min_speech_duration_ms: 300,
            min_volume_threshold: 0.008,
            wakeword_delay_ms: 500,
        }
    }
}

impl VadConfig {
    /// Samples per VAD frame (e.g. 480 at 16 kHz / 30 ms).
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn silence_frames(&self) -> u32 {
        self.vad_end_silence_ms / self.frame_duration_ms
    }

    pub fn pre_speech_frames(&self) -> usize {
        (self.pre_speech_buffer_ms / self.frame_duration_ms) as usize
    }

    pub fn wakeword_delay_frames(&self) -> u32 {
        self.wakeword_delay_ms / self.frame_duration_ms
    }
}

/// Wake-word engine parameters for the built-in energy detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub keyword: String,
    pub threshold: f32,
    /// Refractory window after a detection (engine-internal cooldown).
    pub cooldown_ms: u64,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            keyword: "kiwi".into(),
            threshold: 0.5,
            cooldown_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Use the deterministic mock instead of an HTTP LLM.
    pub use_mock_llm: bool,
    /// Agent chosen when no decision clears the confidence bar.
    pub default_agent: String,
    /// Stack owner for sessions created by voice turns.
    pub user_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            use_mock_llm: true,
            default_agent: "chat_agent".into(),
            user_id: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Regenerate long-term memory every N new short-term entries.
    pub trigger_count: usize,
    /// Bound on retained short-term turns.
    pub max_history_rounds: usize,
    /// Long-term memory JSON file. `None` keeps memory in-process only.
    pub long_term_path: Option<PathBuf>,
    /// Vector index sidecar for semantic recall.
    pub vector_index_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            trigger_count: 10,
            max_history_rounds: 50,
            long_term_path: Some(PathBuf::from("data/long_term_memory.json")),
            vector_index_path: Some(PathBuf::from("data/vector_index.json")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// `false` mutes playback (evaluation mode); requests are still
    /// received and debounced so traces stay complete.
    pub enabled: bool,
    /// Window within which an identical text is spoken only once.
    pub dedup_window_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_window_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Directory for JSONL trace files. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            log_dir: Some(PathBuf::from("logs/message_traces")),
        }
    }
}

/// Top-level configuration assembled by the host.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AurigaConfig {
    pub state: StateConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub wakeword: WakeWordConfig,
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub tts: TtsConfig,
    pub trace: TraceConfig,
    /// Agent roster; empty means "use the built-in default roster".
    pub agents: Vec<AgentProfile>,
}
