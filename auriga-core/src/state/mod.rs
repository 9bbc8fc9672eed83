//! Voice-processing state machine.
//!
//! A pure `(state, event) → outcome` function guarded by one mutex. The
//! machine tracks the wake flag, the VAD-end counter and the wake-word
//! deadline; it never touches engines or the bus itself. Consumers act on
//! the side-effect flags carried by each [`TransitionOutcome`]:
//!
//! - `should_reset_wakeword` — reset the wake engine and clear the deadline
//! - `should_start_timeout` — a deadline was armed at `now + timeout`
//! - `should_trigger_asr` — the speech segment that just ended will be
//!   recognized

pub mod machine;

pub use machine::VoiceStateMachine;

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Overall voice-processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    /// Waiting for a wake word.
    Idle,
    /// Wake word heard, waiting for speech.
    WakewordDetected,
    /// Between utterances while the wake window is open.
    Listening,
    /// Speech currently being captured.
    SpeechDetected,
    /// Recognition in flight.
    Recognizing,
    /// Transient marker for an expired wake window.
    Timeout,
}

impl VoiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            VoiceState::Idle => "idle",
            VoiceState::WakewordDetected => "wakeword_detected",
            VoiceState::Listening => "listening",
            VoiceState::SpeechDetected => "speech_detected",
            VoiceState::Recognizing => "recognizing",
            VoiceState::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    WakewordTriggered,
    WakewordReset,
    WakewordTimeout,
    SpeechStart,
    SpeechEnd,
    RecognitionStart,
    RecognitionSuccess,
    RecognitionFailed,
    Reset,
    ForceIdle,
}

/// State machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// With wake disabled, `SPEECH_START` is always accepted and the wake
    /// states are skipped entirely.
    pub enable_wakeword: bool,
    /// Wake window armed after the first `SPEECH_END` while awake.
    pub wakeword_timeout_secs: f64,
    /// `SPEECH_END` occurrences that auto-reset the wake state; 1 means a
    /// single utterance per wake.
    pub max_vad_end_count: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            enable_wakeword: true,
            wakeword_timeout_secs: 10.0,
            max_vad_end_count: 1,
        }
    }
}

/// Result of feeding one event to the machine.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// `false` when the event was rejected in the current state.
    pub applied: bool,
    pub previous: VoiceState,
    pub current: VoiceState,
    pub event: StateEvent,
    pub reason: String,
    pub should_reset_wakeword: bool,
    pub should_start_timeout: bool,
    pub should_trigger_asr: bool,
}

/// One entry of the bounded transition history.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: VoiceState,
    pub to: VoiceState,
    pub event: StateEvent,
    pub at: Instant,
}

/// Snapshot of the machine's current condition.
#[derive(Debug, Clone)]
pub struct VoiceStateInfo {
    pub current_state: VoiceState,
    pub wakeword_enabled: bool,
    pub wakeword_active: bool,
    /// Monotonic deadline; `None` while no wake window is armed.
    pub wakeword_deadline: Option<Instant>,
    pub vad_end_count: u32,
    pub entered_at: Instant,
}

impl VoiceStateInfo {
    pub fn deadline_expired(&self, now: Instant) -> bool {
        self.wakeword_deadline.is_some_and(|d| now >= d)
    }

    pub fn state_duration(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.entered_at)
    }
}
