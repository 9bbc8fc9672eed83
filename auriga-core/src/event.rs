//! Events exchanged over the system bus.
//!
//! Every hop in the pipeline communicates through [`Event`] values: audio
//! frames, wake-word hits, VAD edges, recognition results, orchestration
//! decisions and TTS traffic all share one envelope. Events are immutable
//! once published — the bus hands out `Arc<Event>` clones and nobody
//! mutates a payload after the fact.
//!
//! Payloads are a tagged union indexed by [`EventType`]. Consumers that
//! historically read payload fields by name can use
//! [`EventPayload::field`], which exposes a key-value view over the typed
//! variants.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch, used for event and trace timestamps.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exhaustive set of event types the core defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SystemStart,
    SystemStop,
    AudioFrameReady,
    AudioDeviceChanged,
    WakewordDetected,
    WakewordReset,
    WakewordTimeout,
    VadSpeechStart,
    VadSpeechEnd,
    AsrRecognitionStart,
    AsrRecognitionSuccess,
    AsrRecognitionFailed,
    StateChanged,
    GuiUpdateText,
    AgentDispatchRequest,
    TtsSpeakRequest,
    TtsSpeakStart,
    TtsSpeakEnd,
    TtsSpeakError,
}

impl EventType {
    /// Stable wire name (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SystemStart => "system_start",
            EventType::SystemStop => "system_stop",
            EventType::AudioFrameReady => "audio_frame_ready",
            EventType::AudioDeviceChanged => "audio_device_changed",
            EventType::WakewordDetected => "wakeword_detected",
            EventType::WakewordReset => "wakeword_reset",
            EventType::WakewordTimeout => "wakeword_timeout",
            EventType::VadSpeechStart => "vad_speech_start",
            EventType::VadSpeechEnd => "vad_speech_end",
            EventType::AsrRecognitionStart => "asr_recognition_start",
            EventType::AsrRecognitionSuccess => "asr_recognition_success",
            EventType::AsrRecognitionFailed => "asr_recognition_failed",
            EventType::StateChanged => "state_changed",
            EventType::GuiUpdateText => "gui_update_text",
            EventType::AgentDispatchRequest => "agent_dispatch_request",
            EventType::TtsSpeakRequest => "tts_speak_request",
            EventType::TtsSpeakStart => "tts_speak_start",
            EventType::TtsSpeakEnd => "tts_speak_end",
            EventType::TtsSpeakError => "tts_speak_error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a dispatch opens a fresh session or resumes a waiting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    New,
    Resume,
}

/// One typed payload variant per event type.
///
/// PCM buffers are shared (`Arc`) because a single audio frame fans out to
/// every worker on the bus.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Lifecycle and reset events carry nothing.
    None,
    AudioFrame {
        pcm: Arc<Vec<i16>>,
        sample_rate: u32,
        channels: u16,
    },
    Wakeword {
        keyword: String,
        confidence: f32,
    },
    Vad {
        is_speech: bool,
        duration_ms: u32,
        audio: Option<Arc<Vec<i16>>>,
    },
    Asr {
        text: String,
        confidence: f32,
        latency_ms: u32,
        is_partial: bool,
    },
    StateChange {
        from: String,
        to: String,
        reason: String,
    },
    AgentRequest {
        agent_name: String,
        query: String,
        context: Value,
        decision: Value,
    },
    TtsRequest {
        text: String,
        priority: TtsPriority,
    },
    TtsStatus {
        text: String,
        error: Option<String>,
    },
    GuiText {
        kind: String,
        body: Value,
    },
    ModuleError {
        module: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsPriority {
    #[default]
    Normal,
    High,
}

impl EventPayload {
    /// Key-value view over the typed payload, for consumers that read
    /// fields by name (tracing, GUI forwarding, trace records).
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            EventPayload::None => None,
            EventPayload::AudioFrame {
                pcm,
                sample_rate,
                channels,
            } => match name {
                "samples" => Some(Value::from(pcm.len())),
                "sample_rate" => Some(Value::from(*sample_rate)),
                "channels" => Some(Value::from(*channels)),
                _ => None,
            },
            EventPayload::Wakeword {
                keyword,
                confidence,
            } => match name {
                "keyword" => Some(Value::from(keyword.clone())),
                "confidence" => Some(Value::from(*confidence)),
                _ => None,
            },
            EventPayload::Vad {
                is_speech,
                duration_ms,
                audio,
            } => match name {
                "is_speech" => Some(Value::from(*is_speech)),
                "duration_ms" => Some(Value::from(*duration_ms)),
                "audio_samples" => Some(Value::from(audio.as_ref().map_or(0, |a| a.len()))),
                _ => None,
            },
            EventPayload::Asr {
                text,
                confidence,
                latency_ms,
                is_partial,
            } => match name {
                "text" => Some(Value::from(text.clone())),
                "confidence" => Some(Value::from(*confidence)),
                "latency_ms" => Some(Value::from(*latency_ms)),
                "is_partial" => Some(Value::from(*is_partial)),
                _ => None,
            },
            EventPayload::StateChange { from, to, reason } => match name {
                "from" => Some(Value::from(from.clone())),
                "to" => Some(Value::from(to.clone())),
                "reason" => Some(Value::from(reason.clone())),
                _ => None,
            },
            EventPayload::AgentRequest {
                agent_name,
                query,
                context,
                decision,
            } => match name {
                "agent_name" => Some(Value::from(agent_name.clone())),
                "query" => Some(Value::from(query.clone())),
                "context" => Some(context.clone()),
                "decision" => Some(decision.clone()),
                _ => None,
            },
            EventPayload::TtsRequest { text, priority } => match name {
                "text" => Some(Value::from(text.clone())),
                "priority" => serde_json::to_value(priority).ok(),
                _ => None,
            },
            EventPayload::TtsStatus { text, error } => match name {
                "text" => Some(Value::from(text.clone())),
                "error" => error.clone().map(Value::from),
                _ => None,
            },
            EventPayload::GuiText { kind, body } => match name {
                "kind" => Some(Value::from(kind.clone())),
                "body" => Some(body.clone()),
                _ => None,
            },
            EventPayload::ModuleError { module, message } => match name {
                "module" => Some(Value::from(module.clone())),
                "message" => Some(Value::from(message.clone())),
                _ => None,
            },
        }
    }
}

/// Immutable record published on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonically increasing per-process sequence number.
    pub id: u64,
    pub event_type: EventType,
    /// Name of the publishing worker.
    pub source: String,
    /// Wall-clock publication time (ms since epoch).
    pub timestamp_ms: u64,
    /// Conversation turn this event belongs to, if known.
    pub msg_id: Option<String>,
    pub session_id: Option<String>,
    pub session_action: Option<SessionAction>,
    pub payload: EventPayload,
}

impl Event {
    /// Build an event with no routing information. The bus assigns `id`.
    pub fn new(event_type: EventType, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: 0,
            event_type,
            source: source.into(),
            timestamp_ms: epoch_millis(),
            msg_id: None,
            session_id: None,
            session_action: None,
            payload,
        }
    }

    pub fn with_msg_id(mut self, msg_id: Option<String>) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn with_session(mut self, session_id: String, action: SessionAction) -> Self {
        self.session_id = Some(session_id);
        self.session_action = Some(action);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_value(EventType::AsrRecognitionSuccess).unwrap();
        assert_eq!(json, "asr_recognition_success");
        let back: EventType = serde_json::from_value(json).unwrap();
        assert_eq!(back, EventType::AsrRecognitionSuccess);
        assert_eq!(EventType::VadSpeechEnd.as_str(), "vad_speech_end");
    }

    #[test]
    fn payload_field_view_exposes_typed_fields() {
        let payload = EventPayload::Asr {
            text: "打开空调".into(),
            confidence: 0.92,
            latency_ms: 180,
            is_partial: false,
        };
        assert_eq!(payload.field("text"), Some(Value::from("打开空调")));
        assert_eq!(payload.field("latency_ms"), Some(Value::from(180)));
        assert_eq!(payload.field("nonexistent"), None);
    }

    #[test]
    fn audio_frame_field_view_reports_length_not_samples() {
        let payload = EventPayload::AudioFrame {
            pcm: Arc::new(vec![0i16; 512]),
            sample_rate: 16_000,
            channels: 1,
        };
        assert_eq!(payload.field("samples"), Some(Value::from(512)));
        assert_eq!(payload.field("sample_rate"), Some(Value::from(16_000)));
    }

    #[test]
    fn session_routing_builder_sets_both_fields() {
        let event = Event::new(
            EventType::AgentDispatchRequest,
            "orchestrator",
            EventPayload::None,
        )
        .with_session("abc".into(), SessionAction::Resume);
        assert_eq!(event.session_id.as_deref(), Some("abc"));
        assert_eq!(event.session_action, Some(SessionAction::Resume));
    }
}
