//! Auriga console host.
//!
//! Wires the assistant core together and drives it from stdin: typed lines
//! become text turns, replies are printed as they come back over the bus.
//! With `AURIGA_ENABLE_AUDIO=1` the microphone pipeline (capture → wake →
//! VAD → ASR) runs as well; without it the host stays headless, which is
//! also how it runs in CI.
//!
//! Commands: `:stats`, `:state`, `:trace`, `:quit`.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use auriga_core::agents::builtin::default_registry;
use auriga_core::config::AurigaConfig;
use auriga_core::dispatch::AgentDispatcher;
use auriga_core::engines::{EchoAsr, EnergyWakeWord, SegmentingVad, TracingTts};
use auriga_core::event::{EventPayload, EventType};
use auriga_core::llm::{ChatModel, HashEmbedder, HttpChatModel, MockChatModel};
use auriga_core::memory::MemoryStore;
use auriga_core::module::Module;
use auriga_core::orchestrator::{
    DecisionMaker, LlmDecisionMaker, Orchestrator, OrchestratorWorker, RuleDecisionMaker,
};
use auriga_core::session::SessionManager;
use auriga_core::trace::MessageTracker;
use auriga_core::workers::{AsrWorker, AudioWorker, TtsWorker, VadWorker, WakeWordWorker};
use auriga_core::world::WorldState;
use auriga_core::SystemController;

fn build_chat_model(config: &AurigaConfig) -> Option<Arc<dyn ChatModel>> {
    if config.orchestrator.use_mock_llm {
        return Some(Arc::new(MockChatModel::new()));
    }
    let api_key = std::env::var("AURIGA_LLM_API_KEY").ok()?;
    let base_url = std::env::var("AURIGA_LLM_BASE_URL")
        .unwrap_or_else(|_| "https://dashscope.aliyuncs.com/compatible-mode/v1".into());
    let model = std::env::var("AURIGA_LLM_MODEL").unwrap_or_else(|_| "qwen-plus".into());
    Some(Arc::new(HttpChatModel::new(base_url, api_key, model)))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = AurigaConfig::default();
    if std::env::var("AURIGA_LLM_API_KEY").is_ok() {
        config.orchestrator.use_mock_llm = false;
    }
    let enable_audio = std::env::var("AURIGA_ENABLE_AUDIO").is_ok_and(|v| v == "1");

    // Shared services — constructed once, passed by reference.
    let bus = SystemController::new();
    let tracker = Arc::new(MessageTracker::new(config.trace.log_dir.clone()));
    let sessions = Arc::new(SessionManager::new());
    let world = Arc::new(WorldState::new());
    let memory = Arc::new(MemoryStore::new(
        config.memory.clone(),
        Some(Arc::new(HashEmbedder::default())),
        None,
    ));
    let chat_model = build_chat_model(&config);
    let registry = Arc::new(default_registry(
        Arc::clone(&world),
        chat_model.clone(),
        &config.agents,
    ));

    let decider: Arc<dyn DecisionMaker> = match (&chat_model, config.orchestrator.use_mock_llm) {
        (Some(model), false) => Arc::new(LlmDecisionMaker::new(Arc::clone(model))),
        _ => {
            info!("using the keyword rule decider");
            Arc::new(RuleDecisionMaker::new(config.orchestrator.default_agent.clone()))
        }
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        Arc::clone(&world),
        Arc::clone(&registry),
        decider,
    ));

    // Workers, registered in pipeline order.
    if enable_audio {
        let audio = AudioWorker::new(Arc::clone(&bus), config.audio.clone());
        bus.register(audio as Arc<dyn Module>)
            .context("register audio worker")?;
    }
    let wake = WakeWordWorker::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Box::new(EnergyWakeWord::new(
            config.wakeword.keyword.clone(),
            config.wakeword.threshold,
            Duration::from_millis(config.wakeword.cooldown_ms),
        )),
    );
    bus.register(wake as Arc<dyn Module>)?;
    let vad = VadWorker::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Box::new(SegmentingVad::new(config.vad.clone())),
        config.vad.frame_size(),
    );
    bus.register(vad as Arc<dyn Module>)?;
    let asr = AsrWorker::new(Arc::clone(&bus), Arc::clone(&tracker), Box::new(EchoAsr::new()));
    bus.register(Arc::clone(&asr) as Arc<dyn Module>)?;
    let tts = TtsWorker::new(Arc::clone(&bus), config.tts.clone(), Box::new(TracingTts));
    bus.register(Arc::clone(&tts) as Arc<dyn Module>)?;
    let orchestrator_worker = OrchestratorWorker::new(
        Arc::clone(&bus),
        Arc::clone(&orchestrator),
        Arc::clone(&tracker),
    );
    bus.register(Arc::clone(&orchestrator_worker) as Arc<dyn Module>)?;
    let dispatcher = AgentDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Arc::clone(&sessions),
        Arc::clone(&registry),
        Arc::clone(&memory),
        config.orchestrator.user_id.clone(),
    );
    bus.register(dispatcher as Arc<dyn Module>)?;

    bus.initialize_all(config.state.clone())
        .context("initialize modules")?;
    bus.start_all().context("start modules")?;

    // Print assistant replies from the out-of-band event tap.
    let mut tap = bus.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = tap.recv().await {
            if let EventPayload::GuiText { kind, body } = &event.payload {
                if kind == "agent_response" {
                    if let Some(message) = body.get("message").and_then(|m| m.as_str()) {
                        println!("auriga> {message}");
                    }
                } else if kind == "orchestrator_decision" {
                    if let (Some(agent), Some(confidence)) = (
                        body.get("agent").and_then(|a| a.as_str()),
                        body.get("confidence").and_then(|c| c.as_f64()),
                    ) {
                        println!("  [routing → {agent} ({confidence:.2})]");
                    }
                }
            } else if event.event_type == EventType::AsrRecognitionSuccess {
                if let EventPayload::Asr { text, .. } = &event.payload {
                    println!("  [heard: {text}]");
                }
            }
        }
    });

    println!("auriga console — type a request, :stats, :state, :trace or :quit");

    let repl_bus = Arc::clone(&bus);
    let repl_tracker = Arc::clone(&tracker);
    let repl_orchestrator = Arc::clone(&orchestrator);
    let repl_asr = Arc::clone(&asr);
    let repl_tts = Arc::clone(&tts);
    let repl_worker = Arc::clone(&orchestrator_worker);
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut out = std::io::stdout();
        loop {
            print!("you> ");
            let _ = out.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
            let line = line.trim();
            match line {
                "" => continue,
                ":quit" | ":q" => break,
                ":state" => {
                    println!(
                        "state: {}",
                        repl_bus
                            .current_state()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".into())
                    );
                }
                ":stats" => {
                    let bus_stats = repl_bus.stats();
                    let orch = repl_orchestrator.stats();
                    let asr = repl_asr.stats();
                    let tts = repl_tts.stats();
                    println!(
                        "bus: {} events ({} dropped, {} handler errors), {} modules",
                        bus_stats.events_published,
                        bus_stats.events_dropped,
                        bus_stats.handler_errors,
                        bus_stats.modules
                    );
                    println!(
                        "orchestrator: {} queries, {} ok, {} failed, {} resumed, {} refused",
                        orch.total_queries,
                        orch.successful_decisions,
                        orch.failed_decisions,
                        orch.resumed_sessions,
                        orch.refused_dispatches
                    );
                    println!(
                        "asr: {} runs, {} ok, {} failed, {} skipped, {:.0} ms avg",
                        asr.total_recognitions,
                        asr.successful,
                        asr.failed,
                        asr.skipped,
                        asr.average_latency_ms
                    );
                    println!(
                        "tts: {} requests, {} spoken, {} debounced, {} muted",
                        tts.requests, tts.spoken, tts.deduplicated, tts.muted
                    );
                }
                ":trace" => {
                    for trace in repl_tracker.get_recent_traces(3) {
                        println!(
                            "{} [{}ms] {} → {}",
                            trace.msg_id,
                            trace.duration_ms(),
                            trace.query,
                            trace.response
                        );
                    }
                }
                text => {
                    if repl_worker.submit_text(text).is_none() {
                        warn!("turn rejected, orchestrator not running");
                    }
                }
            }
        }
    })
    .await
    .context("console loop")?;

    bus.stop_all();
    bus.cleanup_all();
    info!("goodbye");
    Ok(())
}
