//! The state machine proper.
//!
//! All mutation happens under a single mutex. Registered callbacks run
//! after the lock is released — the bus may re-enter the machine from a
//! callback, and holding the lock across user code would deadlock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    StateConfig, StateEvent, TransitionOutcome, TransitionRecord, VoiceState, VoiceStateInfo,
};

/// Retained transition records for debugging.
const HISTORY_CAPACITY: usize = 100;

type TransitionCallback = Arc<dyn Fn(&TransitionOutcome) + Send + Sync>;

struct Inner {
    current: VoiceState,
    wakeword_active: bool,
    wakeword_deadline: Option<Instant>,
    vad_end_count: u32,
    entered_at: Instant,
    history: VecDeque<TransitionRecord>,
}

pub struct VoiceStateMachine {
    config: StateConfig,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<TransitionCallback>>,
}

impl VoiceStateMachine {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                current: VoiceState::Idle,
                wakeword_active: false,
                wakeword_deadline: None,
                vad_end_count: 0,
                entered_at: Instant::now(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn current_state(&self) -> VoiceState {
        self.inner.lock().current
    }

    pub fn state_info(&self) -> VoiceStateInfo {
        let inner = self.inner.lock();
        VoiceStateInfo {
            current_state: inner.current,
            wakeword_enabled: self.config.enable_wakeword,
            wakeword_active: inner.wakeword_active,
            wakeword_deadline: inner.wakeword_deadline,
            vad_end_count: inner.vad_end_count,
            entered_at: inner.entered_at,
        }
    }

    /// Callbacks fire after every applied transition, outside the lock.
    pub fn register_callback(&self, callback: impl Fn(&TransitionOutcome) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn transition_history(&self, limit: usize) -> Vec<TransitionRecord> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Feed one event through the transition table.
    pub fn handle_event(&self, event: StateEvent) -> TransitionOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            let previous = inner.current;
            let mut outcome = self.process(&mut inner, event);
            outcome.previous = previous;

            if outcome.applied && outcome.current != previous {
                if inner.history.len() == HISTORY_CAPACITY {
                    inner.history.pop_front();
                }
                inner.history.push_back(TransitionRecord {
                    from: previous,
                    to: outcome.current,
                    event,
                    at: Instant::now(),
                });
                inner.entered_at = Instant::now();
            }
            outcome
        };

        if outcome.applied {
            debug!(
                event = ?outcome.event,
                from = %outcome.previous,
                to = %outcome.current,
                reason = %outcome.reason,
                "state transition"
            );
            let callbacks: Vec<TransitionCallback> = self.callbacks.lock().clone();
            for cb in callbacks {
                cb(&outcome);
            }
        } else {
            trace!(event = ?outcome.event, state = %outcome.current, reason = %outcome.reason, "event rejected");
        }

        outcome
    }

    /// Synthesize a `WAKEWORD_TIMEOUT` when the armed deadline has passed.
    pub fn check_timeout(&self) -> Option<TransitionOutcome> {
        let expired = {
            let inner = self.inner.lock();
            inner.wakeword_deadline.is_some_and(|d| Instant::now() >= d)
        };
        if expired {
            Some(self.handle_event(StateEvent::WakewordTimeout))
        } else {
            None
        }
    }

    /// Convenience: force the machine back to idle in one step.
    pub fn reset(&self) -> TransitionOutcome {
        self.handle_event(StateEvent::Reset)
    }

    // ── Transition table ────────────────────────────────────────────────

    fn process(&self, inner: &mut Inner, event: StateEvent) -> TransitionOutcome {
        match event {
            StateEvent::WakewordTriggered => self.on_wakeword_triggered(inner),
            StateEvent::WakewordReset => self.on_wake_clear(inner, event, "wake state reset"),
            StateEvent::WakewordTimeout => self.on_wakeword_timeout(inner),
            StateEvent::SpeechStart => self.on_speech_start(inner),
            StateEvent::SpeechEnd => self.on_speech_end(inner),
            StateEvent::RecognitionStart => {
                inner.current = VoiceState::Recognizing;
                applied(inner, event, "recognition started")
            }
            StateEvent::RecognitionSuccess | StateEvent::RecognitionFailed => {
                self.on_recognition_done(inner, event)
            }
            StateEvent::Reset | StateEvent::ForceIdle => {
                inner.wakeword_active = false;
                inner.vad_end_count = 0;
                inner.wakeword_deadline = None;
                inner.current = VoiceState::Idle;
                let mut out = applied(inner, event, "forced back to idle");
                out.should_reset_wakeword = true;
                out
            }
        }
    }

    fn on_wakeword_triggered(&self, inner: &mut Inner) -> TransitionOutcome {
        if !self.config.enable_wakeword {
            return rejected(inner, StateEvent::WakewordTriggered, "wake word disabled");
        }
        if inner.wakeword_active {
            return rejected(inner, StateEvent::WakewordTriggered, "already awake");
        }
        inner.wakeword_active = true;
        inner.vad_end_count = 0;
        inner.wakeword_deadline = None;
        inner.current = VoiceState::WakewordDetected;
        applied(inner, StateEvent::WakewordTriggered, "wake word detected")
    }

    fn on_wake_clear(
        &self,
        inner: &mut Inner,
        event: StateEvent,
        reason: &str,
    ) -> TransitionOutcome {
        if !inner.wakeword_active {
            return rejected(inner, event, "not awake");
        }
        inner.wakeword_active = false;
        inner.vad_end_count = 0;
        inner.wakeword_deadline = None;
        inner.current = VoiceState::Idle;
        let mut out = applied(inner, event, reason);
        out.should_reset_wakeword = true;
        out
    }

    fn on_wakeword_timeout(&self, inner: &mut Inner) -> TransitionOutcome {
        if !inner.wakeword_active {
            return rejected(inner, StateEvent::WakewordTimeout, "not awake");
        }
        // Pass through the transient timeout marker, then settle in idle.
        inner.current = VoiceState::Timeout;
        self.on_wake_clear(inner, StateEvent::WakewordTimeout, "wake window expired")
    }

    fn on_speech_start(&self, inner: &mut Inner) -> TransitionOutcome {
        if self.config.enable_wakeword && !inner.wakeword_active {
            return rejected(inner, StateEvent::SpeechStart, "no wake word yet");
        }
        inner.current = VoiceState::SpeechDetected;
        applied(inner, StateEvent::SpeechStart, "speech onset")
    }

    fn on_speech_end(&self, inner: &mut Inner) -> TransitionOutcome {
        if self.config.enable_wakeword && inner.wakeword_active {
            inner.vad_end_count += 1;

            if inner.vad_end_count >= self.config.max_vad_end_count {
                inner.wakeword_active = false;
                inner.vad_end_count = 0;
                inner.wakeword_deadline = None;
                inner.current = VoiceState::Idle;
                let mut out = applied(
                    inner,
                    StateEvent::SpeechEnd,
                    "utterance budget reached, back to idle",
                );
                out.should_reset_wakeword = true;
                out.should_trigger_asr = true;
                return out;
            }

            let arm_timeout = inner.vad_end_count == 1 && inner.wakeword_deadline.is_none();
            if arm_timeout {
                inner.wakeword_deadline =
                    Some(Instant::now() + Duration::from_secs_f64(self.config.wakeword_timeout_secs));
            }
            inner.current = VoiceState::Listening;
            let mut out = applied(inner, StateEvent::SpeechEnd, "speech ended, still awake");
            out.should_trigger_asr = true;
            out.should_start_timeout = arm_timeout;
            return out;
        }

        // Wake disabled (or already cleared): recognition still fires.
        inner.current = VoiceState::Listening;
        let mut out = applied(inner, StateEvent::SpeechEnd, "speech ended");
        out.should_trigger_asr = true;
        out
    }

    fn on_recognition_done(&self, inner: &mut Inner, event: StateEvent) -> TransitionOutcome {
        let reason = if event == StateEvent::RecognitionSuccess {
            "recognition succeeded"
        } else {
            "recognition failed"
        };
        // The wake flag may already be cleared (utterance budget reached
        // before recognition finished); land in idle in that case.
        if self.config.enable_wakeword && inner.wakeword_active {
            inner.current = VoiceState::Listening;
        } else {
            inner.current = VoiceState::Idle;
        }
        applied(inner, event, reason)
    }
}

fn applied(inner: &Inner, event: StateEvent, reason: &str) -> TransitionOutcome {
    TransitionOutcome {
        applied: true,
        previous: inner.current,
        current: inner.current,
        event,
        reason: reason.into(),
        should_reset_wakeword: false,
        should_start_timeout: false,
        should_trigger_asr: false,
    }
}

fn rejected(inner: &Inner, event: StateEvent, reason: &str) -> TransitionOutcome {
    TransitionOutcome {
        applied: false,
        previous: inner.current,
        current: inner.current,
        event,
        reason: reason.into(),
        should_reset_wakeword: false,
        should_start_timeout: false,
        should_trigger_asr: false,
    }
}
