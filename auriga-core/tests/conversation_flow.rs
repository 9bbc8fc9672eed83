//! End-to-end conversation flows over the real bus.
//!
//! Scripted wake/ASR engines and the built-in segmenting VAD drive the
//! full pipeline: audio frames in, spoken replies out, with the state
//! machine, session stack, tracker and memory all live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use auriga_core::agents::builtin::default_registry;
use auriga_core::bus::SystemController;
use auriga_core::config::{MemoryConfig, OrchestratorConfig, TtsConfig, VadConfig};
use auriga_core::dispatch::AgentDispatcher;
use auriga_core::engines::{
    AsrEngine, Recognition, SegmentingVad, TtsEngine, WakeDetection, WakeWordEngine,
};
use auriga_core::event::{Event, EventPayload, EventType, SessionAction};
use auriga_core::memory::MemoryStore;
use auriga_core::module::Module;
use auriga_core::orchestrator::{Orchestrator, OrchestratorWorker, RuleDecisionMaker};
use auriga_core::session::{SessionManager, SessionState};
use auriga_core::state::{StateConfig, StateEvent, VoiceState};
use auriga_core::trace::MessageTracker;
use auriga_core::workers::{AsrWorker, TtsWorker, VadWorker, WakeWordWorker};
use auriga_core::world::WorldState;

/// Wake engine that fires once per reset on any sufficiently loud frame.
struct ScriptedWake {
    armed: bool,
}

impl WakeWordEngine for ScriptedWake {
    fn detect(&mut self, pcm: &[f32]) -> Option<WakeDetection> {
        if !self.armed {
            return None;
        }
        let rms = (pcm.iter().map(|s| s * s).sum::<f32>() / pcm.len().max(1) as f32).sqrt();
        if rms < 0.3 {
            return None;
        }
        self.armed = false;
        Some(WakeDetection {
            keyword: "kiwi".into(),
            confidence: 0.9,
        })
    }

    fn reset(&mut self) {
        self.armed = true;
    }
}

struct ScriptedAsr {
    text: String,
    delay: Duration,
}

impl AsrEngine for ScriptedAsr {
    fn recognize(&mut self, _pcm: &[i16], _sample_rate: u32) -> auriga_core::Result<Recognition> {
        std::thread::sleep(self.delay);
        Ok(Recognition {
            text: self.text.clone(),
            confidence: 0.95,
        })
    }
}

struct CountingTts {
    calls: Arc<AtomicU64>,
}

impl TtsEngine for CountingTts {
    fn speak(&mut self, _text: &str) -> auriga_core::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn vad_config() -> VadConfig {
    VadConfig {
        sample_rate: 16_000,
        frame_duration_ms: 30,
        energy_threshold: 0.02,
        vad_end_silence_ms: 90,
        pre_speech_buffer_ms: 60,
        min_speech_duration_ms: 90,
        min_volume_threshold: 0.005,
        wakeword_delay_ms: 60,
    }
}

struct Harness {
    bus: Arc<SystemController>,
    tracker: Arc<MessageTracker>,
    sessions: Arc<SessionManager>,
    world: Arc<WorldState>,
    orchestrator: Arc<Orchestrator>,
    orchestrator_worker: Arc<OrchestratorWorker>,
    asr_worker: Arc<AsrWorker>,
    tts_calls: Arc<AtomicU64>,
    events: Arc<Mutex<Vec<Event>>>,
}

fn build_harness(
    state_config: StateConfig,
    asr_text: &str,
    asr_delay: Duration,
    trace_dir: Option<std::path::PathBuf>,
) -> Harness {
    let bus = SystemController::new();
    let tracker = Arc::new(MessageTracker::new(trace_dir));
    let sessions = Arc::new(SessionManager::new());
    let world = Arc::new(WorldState::new());
    let registry = Arc::new(default_registry(Arc::clone(&world), None, &[]));
    let memory = Arc::new(MemoryStore::new(
        MemoryConfig {
            long_term_path: None,
            vector_index_path: None,
            ..MemoryConfig::default()
        },
        None,
        None,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        Arc::clone(&world),
        Arc::clone(&registry),
        Arc::new(RuleDecisionMaker::new("chat_agent")),
    ));

    let wake_worker = WakeWordWorker::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Box::new(ScriptedWake { armed: true }),
    );
    let vad_worker = VadWorker::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Box::new(SegmentingVad::new(vad_config())),
        vad_config().frame_size(),
    );
    let asr_worker = AsrWorker::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Box::new(ScriptedAsr {
            text: asr_text.into(),
            delay: asr_delay,
        }),
    );
    let tts_calls = Arc::new(AtomicU64::new(0));
    let tts_worker = TtsWorker::new(
        Arc::clone(&bus),
        TtsConfig::default(),
        Box::new(CountingTts {
            calls: Arc::clone(&tts_calls),
        }),
    );
    let orchestrator_worker = OrchestratorWorker::new(
        Arc::clone(&bus),
        Arc::clone(&orchestrator),
        Arc::clone(&tracker),
    );
    let dispatcher = AgentDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Arc::clone(&sessions),
        Arc::clone(&registry),
        Arc::clone(&memory),
        "default",
    );

    bus.register(wake_worker as Arc<dyn Module>).unwrap();
    bus.register(vad_worker as Arc<dyn Module>).unwrap();
    bus.register(Arc::clone(&asr_worker) as Arc<dyn Module>).unwrap();
    bus.register(tts_worker as Arc<dyn Module>).unwrap();
    bus.register(Arc::clone(&orchestrator_worker) as Arc<dyn Module>).unwrap();
    bus.register(dispatcher as Arc<dyn Module>).unwrap();

    bus.initialize_all(state_config).unwrap();
    bus.start_all().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    for event_type in [
        EventType::WakewordDetected,
        EventType::WakewordTimeout,
        EventType::VadSpeechStart,
        EventType::VadSpeechEnd,
        EventType::AsrRecognitionSuccess,
        EventType::StateChanged,
        EventType::AgentDispatchRequest,
        EventType::TtsSpeakRequest,
    ] {
        let sink = Arc::clone(&events);
        bus.subscribe(event_type, "harness", move |event| {
            sink.lock().push(event.clone());
        });
    }

    Harness {
        bus,
        tracker,
        sessions,
        world,
        orchestrator,
        orchestrator_worker,
        asr_worker,
        tts_calls,
        events,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn publish_frame(bus: &SystemController, amplitude: i16) {
    bus.publish(Event::new(
        EventType::AudioFrameReady,
        "audio",
        EventPayload::AudioFrame {
            pcm: Arc::new(vec![amplitude; 480]),
            sample_rate: 16_000,
            channels: 1,
        },
    ));
}

fn events_of(harness: &Harness, event_type: EventType) -> Vec<Event> {
    harness
        .events
        .lock()
        .iter()
        .filter(|e| e.event_type == event_type)
        .cloned()
        .collect()
}

/// Wake + single command: the full chain from audio frames to a spoken
/// vehicle-control reply and a completed trace.
#[test]
fn wake_then_command_drives_the_vehicle_and_speaks() {
    let harness = build_harness(
        StateConfig::default(),
        "打开空调",
        Duration::from_millis(10),
        None,
    );

    // Loud frames: the first wakes, the wake delay swallows two, the rest
    // open a speech segment. Quiet frames close it.
    for _ in 0..6 {
        publish_frame(&harness.bus, 20_000);
    }
    for _ in 0..5 {
        publish_frame(&harness.bus, 0);
    }

    let wake_events = events_of(&harness, EventType::WakewordDetected);
    assert_eq!(wake_events.len(), 1);
    let msg_id = wake_events[0].msg_id.clone().expect("turn id minted at wake");

    // The turn completes asynchronously (ASR → orchestrator → agent → TTS).
    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .tracker
            .get_trace(&msg_id)
            .is_some_and(|t| t.end_time_ms.is_some())
    }));

    // Recognition result reached the orchestrator with the right text.
    let asr = events_of(&harness, EventType::AsrRecognitionSuccess);
    assert_eq!(asr.len(), 1);
    match &asr[0].payload {
        EventPayload::Asr { text, .. } => assert_eq!(text, "打开空调"),
        other => panic!("unexpected payload: {other:?}"),
    }

    // The command took effect and was spoken exactly once.
    assert!(harness.world.vehicle().hvac.power);
    assert!(wait_until(Duration::from_secs(2), || {
        harness.tts_calls.load(Ordering::SeqCst) == 1
    }));
    let tts = events_of(&harness, EventType::TtsSpeakRequest);
    assert_eq!(tts.len(), 1);
    match &tts[0].payload {
        EventPayload::TtsRequest { text, .. } => assert_eq!(text, "好的，空调已打开。"),
        other => panic!("unexpected payload: {other:?}"),
    }

    // State walk: idle → wakeword_detected → speech_detected → … → idle.
    let states: Vec<(String, String)> = events_of(&harness, EventType::StateChanged)
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::StateChange { from, to, .. } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    let walk: Vec<&str> = std::iter::once("idle")
        .chain(states.iter().map(|(_, to)| to.as_str()))
        .collect();
    for expected in ["wakeword_detected", "speech_detected", "idle"] {
        assert!(walk.contains(&expected), "missing state {expected} in {walk:?}");
    }
    assert_eq!(harness.bus.current_state(), Some(VoiceState::Idle));

    // Trace covers every stage of the hop chain, in order.
    let trace = harness.tracker.get_trace(&msg_id).unwrap();
    let stages: Vec<&str> = trace.stages.iter().map(|s| s.event_type.as_str()).collect();
    for expected in [
        "wakeword",
        "speech_start",
        "speech_end",
        "recognition_start",
        "recognition_success",
        "orchestrator_input",
        "orchestrator_decision",
        "agent_execution_start",
        "agent_response",
        "tts_request",
    ] {
        assert!(stages.contains(&expected), "missing stage {expected} in {stages:?}");
    }
    assert_eq!(trace.query, "打开空调");

    harness.bus.stop_all();
}

/// Wake timeout: an armed deadline with no further speech resets to idle
/// without a second recognition.
#[test]
fn wake_window_expires_back_to_idle() {
    let harness = build_harness(
        StateConfig {
            enable_wakeword: true,
            wakeword_timeout_secs: 0.2,
            max_vad_end_count: 2,
        },
        "小音量测试",
        Duration::from_millis(5),
        None,
    );

    for _ in 0..6 {
        publish_frame(&harness.bus, 20_000);
    }
    for _ in 0..5 {
        publish_frame(&harness.bus, 0);
    }

    // First utterance done: one recognition, machine listening, deadline armed.
    assert!(wait_until(Duration::from_secs(3), || {
        harness.asr_worker.stats().total_recognitions == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        harness.bus.current_state() == Some(VoiceState::Listening)
    }));

    // No further audio. The polled deadline fires.
    std::thread::sleep(Duration::from_millis(300));
    let outcome = harness.bus.check_timeout().expect("deadline expired");
    assert!(outcome.should_reset_wakeword);
    assert_eq!(harness.bus.current_state(), Some(VoiceState::Idle));
    assert_eq!(events_of(&harness, EventType::WakewordTimeout).len(), 1);
    assert_eq!(harness.asr_worker.stats().total_recognitions, 1);

    harness.bus.stop_all();
}

/// Priority preemption chain: equal priority refused, higher priority
/// pauses, completion auto-resumes.
#[test]
fn session_priorities_guard_the_stack() {
    let harness = build_harness(
        StateConfig::default(),
        "unused",
        Duration::from_millis(5),
        None,
    );
    let orch = &harness.orchestrator;
    let user = orch.user_id();

    // Session A: music, priority 2 (kept running by not dispatching).
    let a = orch.process_query("放首歌", auriga_core::orchestrator::QueryType::UserQuery);
    assert_eq!(a.selected_agent, "music_agent");
    let a_id = a.session_id.unwrap();

    // Same priority: refused, routed to the system agent, stack unchanged.
    let refused = orch.process_query("明天天气怎么样", auriga_core::orchestrator::QueryType::UserQuery);
    assert_eq!(refused.selected_agent, "system_agent");
    assert!(refused.session_id.is_none());
    assert_eq!(
        harness.sessions.get_active_session(user).unwrap().session_id,
        a_id
    );

    // Priority 3 preempts: A pauses, B on top.
    let b = orch.process_query("打开空调", auriga_core::orchestrator::QueryType::UserQuery);
    assert_eq!(b.selected_agent, "vehicle_control_agent");
    let b_id = b.session_id.unwrap();
    assert_eq!(
        harness.sessions.get_session(&a_id).unwrap().state,
        SessionState::Paused
    );

    // B completes; A resumes automatically.
    harness.sessions.complete_session(&b_id, user);
    let resumed = harness.sessions.get_active_session(user).unwrap();
    assert_eq!(resumed.session_id, a_id);
    assert_eq!(resumed.state, SessionState::Running);

    harness.bus.stop_all();
}

/// Waiting-input continuation: the workflow agent asks a question, the
/// next utterance answers it, the same session resumes and finishes.
#[test]
fn waiting_input_answer_resumes_the_same_agent() {
    let harness = build_harness(
        StateConfig::default(),
        "unused",
        Duration::from_millis(5),
        None,
    );

    let first = harness
        .orchestrator_worker
        .submit_text("帮我订酒店")
        .expect("turn accepted");

    // The workflow agent asked its follow-up; the session is waiting.
    assert!(wait_until(Duration::from_secs(3), || {
        harness
            .sessions
            .get_active_session("default")
            .is_some_and(|s| s.state == SessionState::WaitingInput)
    }));
    let waiting = harness.sessions.get_active_session("default").unwrap();
    assert_eq!(waiting.pending_prompt.as_deref(), Some("哪个城市？"));
    assert!(harness.tracker.get_trace(&first).is_some());

    let second = harness
        .orchestrator_worker
        .submit_text("北京")
        .expect("turn accepted");

    assert!(wait_until(Duration::from_secs(3), || {
        harness
            .tracker
            .get_trace(&second)
            .is_some_and(|t| t.end_time_ms.is_some())
    }));

    // The dispatch carried the resume routing and the user's answer.
    let dispatches = events_of(&harness, EventType::AgentDispatchRequest);
    let resume = dispatches
        .iter()
        .find(|e| e.session_action == Some(SessionAction::Resume))
        .expect("resume dispatch");
    assert_eq!(resume.session_id.as_deref(), Some(waiting.session_id.as_str()));
    match &resume.payload {
        EventPayload::AgentRequest {
            agent_name,
            context,
            ..
        } => {
            assert_eq!(agent_name, "workflow_agent");
            assert_eq!(context["user_input"], Value::from("北京"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    assert!(wait_until(Duration::from_secs(2), || {
        harness
            .sessions
            .get_session(&waiting.session_id)
            .is_some_and(|s| s.state == SessionState::Completed)
    }));
    let reply = harness.tracker.get_trace(&second).unwrap().response;
    assert!(reply.contains("北京"), "reply was: {reply}");

    harness.bus.stop_all();
}

/// A second speech segment during an in-flight recognition is skipped.
#[test]
fn concurrent_recognition_is_suppressed() {
    let harness = build_harness(
        StateConfig {
            enable_wakeword: false,
            ..StateConfig::default()
        },
        "第一段",
        Duration::from_millis(400),
        None,
    );

    let segment = EventPayload::Vad {
        is_speech: false,
        duration_ms: 600,
        audio: Some(Arc::new(vec![900i16; 9_600])),
    };
    harness.bus.publish(Event::new(
        EventType::VadSpeechEnd,
        "vad",
        segment.clone(),
    ));
    assert!(wait_until(Duration::from_millis(300), || {
        harness.asr_worker.is_busy()
    }));
    harness
        .bus
        .publish(Event::new(EventType::VadSpeechEnd, "vad", segment));

    assert!(wait_until(Duration::from_secs(3), || {
        !harness.asr_worker.is_busy()
    }));
    std::thread::sleep(Duration::from_millis(100));

    let stats = harness.asr_worker.stats();
    assert_eq!(stats.total_recognitions, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(events_of(&harness, EventType::AsrRecognitionSuccess).len(), 1);

    harness.bus.stop_all();
}

/// The persisted trace line parses, keeps stage order and derives
/// duration from the recorded bounds.
#[test]
fn completed_turns_land_in_the_daily_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let harness = build_harness(
        StateConfig::default(),
        "unused",
        Duration::from_millis(5),
        Some(dir.path().to_path_buf()),
    );

    let msg_id = harness
        .orchestrator_worker
        .submit_text("明天天气怎么样")
        .expect("turn accepted");
    assert!(wait_until(Duration::from_secs(3), || {
        harness
            .tracker
            .get_trace(&msg_id)
            .is_some_and(|t| t.end_time_ms.is_some())
    }));

    // The file append happens just after end_time is stamped.
    assert!(wait_until(Duration::from_secs(2), || {
        std::fs::read_dir(dir.path()).is_ok_and(|mut d| d.next().is_some())
    }));
    let file = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
    let content = std::fs::read_to_string(file.path()).unwrap();
    let line = content.lines().next().expect("one JSONL line");
    let parsed: Value = serde_json::from_str(line).unwrap();

    assert_eq!(parsed["msg_id"], Value::from(msg_id));
    let stages = parsed["stages"].as_array().unwrap();
    assert!(stages.len() >= 3);
    let timestamps: Vec<u64> = stages
        .iter()
        .map(|s| s["timestamp_ms"].as_u64().unwrap())
        .collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        parsed["duration_ms"].as_u64().unwrap(),
        parsed["end_time_ms"].as_u64().unwrap() - parsed["start_time_ms"].as_u64().unwrap()
    );

    harness.bus.stop_all();
}

/// Replaying `RESET` from any mid-conversation state lands in idle with
/// the wake bookkeeping cleared in one step.
#[test]
fn reset_is_single_step_from_any_state() {
    let harness = build_harness(
        StateConfig {
            enable_wakeword: true,
            wakeword_timeout_secs: 10.0,
            max_vad_end_count: 3,
        },
        "unused",
        Duration::from_millis(5),
        None,
    );

    harness.bus.handle_state_event(StateEvent::WakewordTriggered);
    harness.bus.handle_state_event(StateEvent::SpeechStart);
    harness.bus.handle_state_event(StateEvent::SpeechEnd);
    let machine = harness.bus.state_machine().unwrap();
    assert!(machine.state_info().wakeword_deadline.is_some());

    let outcome = harness.bus.handle_state_event(StateEvent::Reset).unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.current, VoiceState::Idle);
    assert!(outcome.should_reset_wakeword);
    let info = machine.state_info();
    assert!(!info.wakeword_active);
    assert!(info.wakeword_deadline.is_none());

    harness.bus.stop_all();
}
