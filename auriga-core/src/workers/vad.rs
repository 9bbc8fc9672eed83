//! VAD worker.
//!
//! Reframes incoming audio into the engine's fixed frame size, feeds it
//! through the VAD engine and turns segment edges into bus events:
//! `VAD_SPEECH_START` on onset, `VAD_SPEECH_END` (with the assembled PCM
//! and duration) once trailing silence closes the segment. Frames are
//! processed only while the machine is past the wake gate, and the engine
//! arms a short suppression window after each wake hit so the wake phrase
//! itself cannot trigger speech.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::bus::SystemController;
use crate::engines::{VadEngine, VadFrameOutcome, VadSegmentEdge};
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;
use crate::state::{StateEvent, VoiceState};
use crate::trace::MessageTracker;

pub struct VadWorker {
    controller: Arc<SystemController>,
    tracker: Arc<MessageTracker>,
    engine: Mutex<Box<dyn VadEngine>>,
    /// Reframing buffer between bus frame size and engine frame size.
    buffer: Mutex<Vec<i16>>,
    frame_size: usize,
    /// Turn id propagated from the wake-word hit.
    current_msg_id: Mutex<Option<String>>,
    running: AtomicBool,
    frames_processed: AtomicU64,
    speech_segments: AtomicU64,
}

impl VadWorker {
    pub const NAME: &'static str = "vad";

    pub fn new(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        engine: Box<dyn VadEngine>,
        frame_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            tracker,
            engine: Mutex::new(engine),
            buffer: Mutex::new(Vec::new()),
            frame_size: frame_size.max(1),
            current_msg_id: Mutex::new(None),
            running: AtomicBool::new(false),
            frames_processed: AtomicU64::new(0),
            speech_segments: AtomicU64::new(0),
        })
    }

    pub fn speech_segments(&self) -> u64 {
        self.speech_segments.load(Ordering::Relaxed)
    }

    fn should_process(&self) -> bool {
        matches!(
            self.controller.current_state(),
            Some(
                VoiceState::WakewordDetected
                    | VoiceState::Listening
                    | VoiceState::SpeechDetected
                    | VoiceState::Recognizing
            )
        )
    }

    fn on_frame(&self, pcm: &[i16]) {
        self.buffer.lock().extend_from_slice(pcm);

        // The buffer lock is released before each outcome is handled:
        // publishing re-enters this module (wake reset takes the same
        // locks on this thread).
        loop {
            let frame: Vec<i16> = {
                let mut buffer = self.buffer.lock();
                if buffer.len() < self.frame_size {
                    break;
                }
                buffer.drain(..self.frame_size).collect()
            };
            self.frames_processed.fetch_add(1, Ordering::Relaxed);
            let outcome = self.engine.lock().process_frame(&frame);
            self.on_outcome(outcome);
        }
    }

    fn on_outcome(&self, outcome: VadFrameOutcome) {
        let msg_id = self.current_msg_id.lock().clone();
        match outcome.edge {
            Some(VadSegmentEdge::SpeechStart) => {
                debug!("speech start");
                if let Some(id) = &msg_id {
                    self.tracker.add_trace(
                        id,
                        Self::NAME,
                        "speech_start",
                        Some(json!({ "event": "audio_frame" })),
                        None,
                        serde_json::Map::new(),
                    );
                }
                self.controller.publish(
                    Event::new(
                        EventType::VadSpeechStart,
                        Self::NAME,
                        EventPayload::Vad {
                            is_speech: true,
                            duration_ms: 0,
                            audio: None,
                        },
                    )
                    .with_msg_id(msg_id),
                );
                self.controller.handle_state_event(StateEvent::SpeechStart);
            }
            Some(VadSegmentEdge::SpeechEnd) => {
                let audio = outcome.audio.map(Arc::new);
                let segment = self.speech_segments.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    segment,
                    duration_ms = outcome.duration_ms,
                    samples = audio.as_ref().map_or(0, |a| a.len()),
                    "speech end"
                );
                if let Some(id) = &msg_id {
                    self.tracker.add_trace(
                        id,
                        Self::NAME,
                        "speech_end",
                        None,
                        Some(json!({
                            "duration_ms": outcome.duration_ms,
                            "samples": audio.as_ref().map_or(0, |a| a.len()),
                        })),
                        serde_json::Map::new(),
                    );
                }
                self.controller.publish(
                    Event::new(
                        EventType::VadSpeechEnd,
                        Self::NAME,
                        EventPayload::Vad {
                            is_speech: false,
                            duration_ms: outcome.duration_ms,
                            audio,
                        },
                    )
                    .with_msg_id(msg_id),
                );
                self.controller.handle_state_event(StateEvent::SpeechEnd);
            }
            None => {}
        }
    }
}

impl Module for VadWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_event(&self, event: &Event) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match (&event.event_type, &event.payload) {
            (EventType::AudioFrameReady, EventPayload::AudioFrame { pcm, .. }) => {
                if self.should_process() {
                    {
                        let mut current = self.current_msg_id.lock();
                        if current.is_none() {
                            *current = event.msg_id.clone();
                        }
                    }
                    self.on_frame(pcm);
                }
            }
            (EventType::WakewordDetected, _) => {
                *self.current_msg_id.lock() = event.msg_id.clone();
                self.engine.lock().on_wakeword_detected();
            }
            (EventType::WakewordReset, _) => {
                self.engine.lock().reset();
                self.buffer.lock().clear();
            }
            (EventType::SystemStop, _) => self.stop(),
            _ => {}
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
