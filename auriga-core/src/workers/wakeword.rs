//! Wake-word worker.
//!
//! Listens to raw audio frames, but only while the machine sits in `idle`
//! or `wakeword_detected` — an active conversation cannot re-trigger
//! itself. A detection opens the turn: this worker mints the `msg_id`,
//! publishes `WAKEWORD_DETECTED` and drives the state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use crate::bus::SystemController;
use crate::engines::WakeWordEngine;
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;
use crate::state::{StateEvent, VoiceState};
use crate::trace::{MessageTracker, TurnSource};

pub struct WakeWordWorker {
    controller: Arc<SystemController>,
    tracker: Arc<MessageTracker>,
    engine: Mutex<Box<dyn WakeWordEngine>>,
    running: AtomicBool,
    frames_processed: AtomicU64,
    detections: AtomicU64,
}

impl WakeWordWorker {
    pub const NAME: &'static str = "wakeword";

    pub fn new(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        engine: Box<dyn WakeWordEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            tracker,
            engine: Mutex::new(engine),
            running: AtomicBool::new(false),
            frames_processed: AtomicU64::new(0),
            detections: AtomicU64::new(0),
        })
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    /// Frames are only inspected while nothing downstream is active.
    fn should_process(&self) -> bool {
        matches!(
            self.controller.current_state(),
            Some(VoiceState::Idle | VoiceState::WakewordDetected) | None
        )
    }

    fn on_frame(&self, pcm: &[i16]) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);

        let detection = {
            let mut engine = self.engine.lock();
            let float_pcm: Vec<f32> = pcm.iter().map(|s| *s as f32 / 32768.0).collect();
            engine.detect(&float_pcm)
        };
        let Some(detection) = detection else {
            return;
        };

        self.detections.fetch_add(1, Ordering::Relaxed);
        info!(
            keyword = %detection.keyword,
            confidence = detection.confidence,
            "wake word detected"
        );

        // The detection opens a new turn.
        let msg_id = self
            .tracker
            .create_message_id(TurnSource::Wakeword, serde_json::Map::new());
        self.tracker.add_trace(
            &msg_id,
            Self::NAME,
            "wakeword",
            None,
            Some(json!({
                "keyword": detection.keyword,
                "confidence": detection.confidence,
            })),
            serde_json::Map::new(),
        );

        self.controller.publish(
            Event::new(
                EventType::WakewordDetected,
                Self::NAME,
                EventPayload::Wakeword {
                    keyword: detection.keyword,
                    confidence: detection.confidence,
                },
            )
            .with_msg_id(Some(msg_id)),
        );
        self.controller
            .handle_state_event(StateEvent::WakewordTriggered);
    }
}

impl Module for WakeWordWorker {
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
                    self.on_frame(pcm);
                }
            }
            (EventType::WakewordReset, _) => {
                self.engine.lock().reset();
            }
            (EventType::SystemStop, _) => self.stop(),
            _ => {}
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::WakeDetection;
    use crate::state::StateConfig;

    /// Fires on every frame whose first sample is the trigger value.
    struct TriggerWake {
        resets: Arc<AtomicU64>,
    }

    impl WakeWordEngine for TriggerWake {
        fn detect(&mut self, pcm: &[f32]) -> Option<WakeDetection> {
            (pcm.first().copied().unwrap_or(0.0) > 0.5).then(|| WakeDetection {
                keyword: "kiwi".into(),
                confidence: 0.9,
            })
        }
        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame_event(amplitude: i16) -> Event {
        Event::new(
            EventType::AudioFrameReady,
            "audio",
            EventPayload::AudioFrame {
                pcm: Arc::new(vec![amplitude; 480]),
                sample_rate: 16_000,
                channels: 1,
            },
        )
    }

    fn setup() -> (Arc<SystemController>, Arc<WakeWordWorker>, Arc<AtomicU64>) {
        let bus = SystemController::new();
        bus.initialize_all(StateConfig::default()).unwrap();
        let tracker = Arc::new(MessageTracker::new(None));
        let resets = Arc::new(AtomicU64::new(0));
        let worker = WakeWordWorker::new(
            Arc::clone(&bus),
            tracker,
            Box::new(TriggerWake {
                resets: Arc::clone(&resets),
            }),
        );
        bus.register(Arc::clone(&worker) as Arc<dyn Module>).unwrap();
        worker.start().unwrap();
        (bus, worker, resets)
    }

    #[test]
    fn detection_publishes_event_with_msg_id_and_wakes_the_machine() {
        let (bus, worker, _) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        bus.subscribe(EventType::WakewordDetected, "probe", move |event| {
            seen_cb.lock().push(event.clone());
        });

        bus.publish(frame_event(30_000));

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].msg_id.as_deref().unwrap().starts_with("msg_"));
        assert_eq!(bus.current_state(), Some(VoiceState::WakewordDetected));
        assert_eq!(worker.detections(), 1);
    }

    #[test]
    fn frames_are_dropped_outside_idle_and_wake_states() {
        let (bus, worker, _) = setup();
        bus.publish(frame_event(30_000)); // wakes
        bus.handle_state_event(StateEvent::SpeechStart);
        assert_eq!(bus.current_state(), Some(VoiceState::SpeechDetected));

        bus.publish(frame_event(30_000));
        assert_eq!(worker.detections(), 1, "conversation must not self-trigger");
    }

    #[test]
    fn wake_reset_event_resets_the_engine() {
        let (bus, _, resets) = setup();
        bus.publish(Event::new(
            EventType::WakewordReset,
            "system",
            EventPayload::None,
        ));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }
}
