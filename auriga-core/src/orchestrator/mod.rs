//! Orchestration: route each recognized utterance to a domain agent.
//!
//! [`Orchestrator::process_query`] is the brain of a turn. It either
//! resumes the session that is waiting for this user's answer, or gathers
//! context (memory, world state, agent roster), asks a [`DecisionMaker`]
//! to pick an agent, and opens a session for it — refusing dispatch when
//! the active session outranks the new request.
//!
//! Session ownership is split deliberately: the orchestrator is the only
//! place that calls `create_session`/`resume_session`; completion and
//! waiting-input transitions belong to the dispatcher.

pub mod decision;

pub use decision::{DecisionMaker, LlmDecisionMaker, ReplyKind, RuleDecisionMaker};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agents::{AgentProfile, AgentRegistry};
use crate::bus::SystemController;
use crate::config::OrchestratorConfig;
use crate::event::{Event, EventPayload, EventType, SessionAction};
use crate::memory::{LongTermMemory, MemoryStore, TurnMemory};
use crate::module::Module;
use crate::session::SessionManager;
use crate::trace::{MessageTracker, TurnSource};
use crate::world::{StateSnapshot, WorldState};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    UserQuery,
    SystemEvent,
}

/// Everything a decider sees for one query.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub query: String,
    pub query_type: QueryType,
    pub short_term: Vec<TurnMemory>,
    pub long_term: LongTermMemory,
    pub world: Vec<StateSnapshot>,
    pub agents: Vec<AgentProfile>,
}

/// The orchestrator's output: which agent runs, with what routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub selected_agent: String,
    pub confidence: f32,
    pub reasoning: String,
    pub parameters: serde_json::Map<String, Value>,
    pub session_id: Option<String>,
    pub session_action: Option<SessionAction>,
}

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub total_queries: u64,
    pub successful_decisions: u64,
    pub failed_decisions: u64,
    pub resumed_sessions: u64,
    pub refused_dispatches: u64,
}

/// Confidence below which the decision falls back to the default agent.
const CONFIDENCE_FLOOR: f32 = 0.5;

pub struct Orchestrator {
    config: OrchestratorConfig,
    sessions: Arc<SessionManager>,
    memory: Arc<MemoryStore>,
    world: Arc<WorldState>,
    registry: Arc<AgentRegistry>,
    decider: Arc<dyn DecisionMaker>,
    fallback: RuleDecisionMaker,
    total_queries: AtomicU64,
    successful_decisions: AtomicU64,
    failed_decisions: AtomicU64,
    resumed_sessions: AtomicU64,
    refused_dispatches: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        sessions: Arc<SessionManager>,
        memory: Arc<MemoryStore>,
        world: Arc<WorldState>,
        registry: Arc<AgentRegistry>,
        decider: Arc<dyn DecisionMaker>,
    ) -> Self {
        let fallback = RuleDecisionMaker::new(config.default_agent.clone());
        Self {
            config,
            sessions,
            memory,
            world,
            registry,
            decider,
            fallback,
            total_queries: AtomicU64::new(0),
            successful_decisions: AtomicU64::new(0),
            failed_decisions: AtomicU64::new(0),
            resumed_sessions: AtomicU64::new(0),
            refused_dispatches: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// Route one utterance. Never fails — degraded decisions route to the
    /// default agent.
    pub fn process_query(&self, query: &str, query_type: QueryType) -> Decision {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let user = self.config.user_id.as_str();

        // 1. A session waiting for input claims utterances classified as
        //    answers to its pending prompt.
        if let Some(active) = self.sessions.get_active_session(user) {
            if active.state == crate::session::SessionState::WaitingInput {
                let kind = self.decider.classify_reply(
                    query,
                    active.pending_prompt.as_deref().unwrap_or(""),
                    active.expected_input_type.as_deref().unwrap_or("text"),
                );
                if kind == ReplyKind::Answer {
                    info!(
                        session_id = %active.session_id,
                        agent = %active.agent_name,
                        "utterance answers the pending prompt, resuming session"
                    );
                    self.sessions.resume_session(&active.session_id, query);
                    self.resumed_sessions.fetch_add(1, Ordering::Relaxed);

                    let mut parameters = serde_json::Map::new();
                    parameters.insert("user_input".into(), Value::from(query));
                    parameters.insert(
                        "previous_prompt".into(),
                        Value::from(active.pending_prompt.clone().unwrap_or_default()),
                    );
                    parameters.insert("context".into(), Value::Object(active.context.clone()));
                    return Decision {
                        selected_agent: active.agent_name,
                        confidence: 1.0,
                        reasoning: "resume the session waiting for this answer".into(),
                        parameters,
                        session_id: Some(active.session_id),
                        session_action: Some(SessionAction::Resume),
                    };
                }
                // A new intent while something waits: fall through to a
                // fresh decision; priority rules decide what happens.
            }
        }

        // 2–3. Gather context and decide.
        let context = self.build_context(query, query_type);
        let mut decision = match self.decider.decide(&context) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "primary decider failed, using keyword fallback");
                self.failed_decisions.fetch_add(1, Ordering::Relaxed);
                match self.fallback.decide(&context) {
                    Ok(decision) => decision,
                    Err(e) => {
                        error!(error = %e, "fallback decider failed, default agent");
                        self.default_decision(&e.to_string())
                    }
                }
            }
        };

        if decision.confidence < CONFIDENCE_FLOOR
            && decision.selected_agent != self.config.default_agent
        {
            decision.reasoning = format!(
                "low confidence ({:.2}), falling back to {}; was: {}",
                decision.confidence, self.config.default_agent, decision.reasoning
            );
            decision.selected_agent = self.config.default_agent.clone();
        }

        if decision.confidence > CONFIDENCE_FLOOR {
            self.successful_decisions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_decisions.fetch_add(1, Ordering::Relaxed);
        }

        // 4. Open a session; refusal re-routes to the system agent.
        let priority = self.registry.priority_of(&decision.selected_agent);
        match self
            .sessions
            .create_session(&decision.selected_agent, user, priority)
        {
            Some(session) => {
                decision.session_id = Some(session.session_id.clone());
                decision.session_action = Some(SessionAction::New);
                decision
                    .parameters
                    .insert("priority".into(), Value::from(priority));
                info!(
                    agent = %decision.selected_agent,
                    session_id = %session.session_id,
                    confidence = decision.confidence,
                    "decision ready for dispatch"
                );
                decision
            }
            None => {
                self.refused_dispatches.fetch_add(1, Ordering::Relaxed);
                let blocker = self
                    .sessions
                    .get_active_session(user)
                    .map(|s| s.agent_name)
                    .unwrap_or_else(|| "当前任务".into());
                let mut parameters = serde_json::Map::new();
                parameters.insert(
                    "response".into(),
                    Value::from(format!("当前正在执行{blocker}，请先完成当前操作。")),
                );
                Decision {
                    selected_agent: "system_agent".into(),
                    confidence: 1.0,
                    reasoning: "active session is not interruptible at this priority".into(),
                    parameters,
                    session_id: None,
                    session_action: None,
                }
            }
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            successful_decisions: self.successful_decisions.load(Ordering::Relaxed),
            failed_decisions: self.failed_decisions.load(Ordering::Relaxed),
            resumed_sessions: self.resumed_sessions.load(Ordering::Relaxed),
            refused_dispatches: self.refused_dispatches.load(Ordering::Relaxed),
        }
    }

    fn build_context(&self, query: &str, query_type: QueryType) -> DecisionContext {
        DecisionContext {
            query: query.into(),
            query_type,
            short_term: self.memory.related_turns(query, 5),
            long_term: self.memory.long_term(),
            world: self.world.snapshot(),
            agents: self.registry.enabled_profiles(),
        }
    }

    fn default_decision(&self, cause: &str) -> Decision {
        Decision {
            selected_agent: self.config.default_agent.clone(),
            confidence: 0.1,
            reasoning: format!("decision failed, degraded to default agent: {cause}"),
            parameters: serde_json::Map::new(),
            session_id: None,
            session_action: None,
        }
    }
}

/// Bus adapter: listens for recognition results, runs the orchestrator off
/// the bus thread and publishes the dispatch request. Injected text turns
/// enter here too.
pub struct OrchestratorWorker {
    controller: Arc<SystemController>,
    orchestrator: Arc<Orchestrator>,
    tracker: Arc<MessageTracker>,
    running: AtomicBool,
}

impl OrchestratorWorker {
    pub const NAME: &'static str = "orchestrator";

    pub fn new(
        controller: Arc<SystemController>,
        orchestrator: Arc<Orchestrator>,
        tracker: Arc<MessageTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            orchestrator,
            tracker,
            running: AtomicBool::new(false),
        })
    }

    /// Entry point for typed turns (console, GUI text box). Creates the
    /// turn id and runs the same path as a recognized utterance.
    pub fn submit_text(self: &Arc<Self>, text: &str) -> Option<String> {
        if !self.running.load(Ordering::SeqCst) {
            warn!("text input dropped: orchestrator not running");
            return None;
        }
        let msg_id = self
            .tracker
            .create_message_id(TurnSource::TextInput, serde_json::Map::new());
        self.tracker.update_query(&msg_id, text);
        self.tracker.add_trace(
            &msg_id,
            Self::NAME,
            "text_input",
            Some(json!({ "text": text })),
            None,
            serde_json::Map::new(),
        );

        let controller = Arc::clone(&self.controller);
        let orchestrator = Arc::clone(&self.orchestrator);
        let tracker = Arc::clone(&self.tracker);
        let text = text.to_string();
        let id = msg_id.clone();
        std::thread::spawn(move || route(&controller, &orchestrator, &tracker, &text, Some(id)));
        Some(msg_id)
    }
}

/// Decide and dispatch one utterance. Runs on a worker thread — decisions
/// may block on an LLM and must never run on the publisher's thread.
fn route(
    controller: &Arc<SystemController>,
    orchestrator: &Orchestrator,
    tracker: &MessageTracker,
    text: &str,
    msg_id: Option<String>,
) {
    if let Some(id) = &msg_id {
        tracker.add_trace(
            id,
            OrchestratorWorker::NAME,
            "orchestrator_input",
            Some(json!({ "text": text })),
            None,
            serde_json::Map::new(),
        );
    }

    let decision = orchestrator.process_query(text, QueryType::UserQuery);

    if let Some(id) = &msg_id {
        tracker.add_trace(
            id,
            OrchestratorWorker::NAME,
            "orchestrator_decision",
            None,
            serde_json::to_value(&decision).ok(),
            serde_json::Map::new(),
        );
    }

    // Show the decision before the agent runs.
    let gui = Event::new(
        EventType::GuiUpdateText,
        OrchestratorWorker::NAME,
        EventPayload::GuiText {
            kind: "orchestrator_decision".into(),
            body: json!({
                "query": text,
                "agent": decision.selected_agent,
                "confidence": decision.confidence,
                "reasoning": decision.reasoning,
            }),
        },
    )
    .with_msg_id(msg_id.clone());
    controller.publish(gui);

    let mut dispatch = Event::new(
        EventType::AgentDispatchRequest,
        OrchestratorWorker::NAME,
        EventPayload::AgentRequest {
            agent_name: decision.selected_agent.clone(),
            query: text.to_string(),
            context: Value::Object(decision.parameters.clone()),
            decision: serde_json::to_value(&decision).unwrap_or(Value::Null),
        },
    )
    .with_msg_id(msg_id);
    dispatch.session_id = decision.session_id.clone();
    dispatch.session_action = decision.session_action;
    controller.publish(dispatch);
}

impl Module for OrchestratorWorker {
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
            (
                EventType::AsrRecognitionSuccess,
                EventPayload::Asr {
                    text, is_partial, ..
                },
            ) if !is_partial && !text.trim().is_empty() => {
                let text = text.trim().to_string();
                let msg_id = event.msg_id.clone();
                if let Some(id) = &msg_id {
                    self.tracker.update_query(id, &text);
                }
                let controller = Arc::clone(&self.controller);
                let orchestrator = Arc::clone(&self.orchestrator);
                let tracker = Arc::clone(&self.tracker);
                std::thread::spawn(move || {
                    route(&controller, &orchestrator, &tracker, &text, msg_id)
                });
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
    use crate::agents::builtin::default_registry;
    use crate::config::MemoryConfig;
    use crate::session::SessionState;

    fn orchestrator() -> Orchestrator {
        let sessions = Arc::new(SessionManager::new());
        let memory = Arc::new(MemoryStore::new(
            MemoryConfig {
                long_term_path: None,
                vector_index_path: None,
                ..MemoryConfig::default()
            },
            None,
            None,
        ));
        let world = Arc::new(WorldState::new());
        let registry = Arc::new(default_registry(Arc::clone(&world), None, &[]));
        let decider: Arc<dyn DecisionMaker> = Arc::new(RuleDecisionMaker::new("chat_agent"));
        Orchestrator::new(
            OrchestratorConfig::default(),
            sessions,
            memory,
            world,
            registry,
            decider,
        )
    }

    #[test]
    fn recognized_command_opens_a_session_for_the_chosen_agent() {
        let orch = orchestrator();
        let decision = orch.process_query("打开空调", QueryType::UserQuery);
        assert_eq!(decision.selected_agent, "vehicle_control_agent");
        assert_eq!(decision.session_action, Some(SessionAction::New));
        let session_id = decision.session_id.expect("session id attached");

        let active = orch.sessions.get_active_session(orch.user_id()).unwrap();
        assert_eq!(active.session_id, session_id);
        assert_eq!(active.state, SessionState::Running);
        assert_eq!(active.priority, 3);
    }

    #[test]
    fn equal_priority_request_routes_to_system_agent_and_keeps_the_stack() {
        let orch = orchestrator();
        let first = orch.process_query("放首歌", QueryType::UserQuery);
        assert_eq!(first.selected_agent, "music_agent");
        let music_session = first.session_id.unwrap();

        let second = orch.process_query("明天天气怎么样", QueryType::UserQuery);
        assert_eq!(second.selected_agent, "system_agent");
        assert!(second.session_id.is_none());
        assert!(second.parameters["response"]
            .as_str()
            .unwrap()
            .contains("music_agent"));

        let active = orch.sessions.get_active_session(orch.user_id()).unwrap();
        assert_eq!(active.session_id, music_session);
        assert_eq!(orch.stats().refused_dispatches, 1);
    }

    #[test]
    fn higher_priority_request_preempts_and_lower_session_pauses() {
        let orch = orchestrator();
        let music = orch.process_query("放首歌", QueryType::UserQuery);
        let vehicle = orch.process_query("打开空调", QueryType::UserQuery);
        assert_eq!(vehicle.selected_agent, "vehicle_control_agent");

        let music_session = orch
            .sessions
            .get_session(&music.session_id.unwrap())
            .unwrap();
        assert_eq!(music_session.state, SessionState::Paused);
        assert_eq!(
            orch.sessions
                .get_active_session(orch.user_id())
                .unwrap()
                .session_id,
            vehicle.session_id.unwrap()
        );
    }

    #[test]
    fn answer_to_a_waiting_session_resumes_it() {
        let orch = orchestrator();
        let first = orch.process_query("帮我订酒店", QueryType::UserQuery);
        assert_eq!(first.selected_agent, "workflow_agent");
        let session_id = first.session_id.unwrap();
        orch.sessions.wait_for_input(&session_id, "哪个城市？", "text");

        let second = orch.process_query("北京", QueryType::UserQuery);
        assert_eq!(second.selected_agent, "workflow_agent");
        assert_eq!(second.session_action, Some(SessionAction::Resume));
        assert_eq!(second.session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(second.parameters["user_input"], "北京");
        assert_eq!(second.parameters["previous_prompt"], "哪个城市？");

        let resumed = orch.sessions.get_session(&session_id).unwrap();
        assert_eq!(resumed.state, SessionState::Running);
        assert_eq!(resumed.context["last_user_input"], "北京");
    }

    #[test]
    fn new_intent_while_waiting_takes_the_decision_path() {
        let orch = orchestrator();
        let first = orch.process_query("帮我订酒店", QueryType::UserQuery);
        let workflow_id = first.session_id.unwrap();
        orch.sessions.wait_for_input(&workflow_id, "哪个城市？", "text");

        // A command (priority 3 outranks the waiting workflow): preempts.
        let second = orch.process_query("打开空调", QueryType::UserQuery);
        assert_eq!(second.selected_agent, "vehicle_control_agent");
        assert_eq!(
            orch.sessions.get_session(&workflow_id).unwrap().state,
            SessionState::Paused
        );
    }

    #[test]
    fn chat_fallback_for_unrouted_queries() {
        let orch = orchestrator();
        let decision = orch.process_query("随便聊聊", QueryType::UserQuery);
        assert_eq!(decision.selected_agent, "chat_agent");
        assert!(decision.session_id.is_some());
    }

    struct FailingDecider;

    impl DecisionMaker for FailingDecider {
        fn decide(&self, _context: &DecisionContext) -> Result<Decision> {
            Err(crate::error::AurigaError::Llm("boom".into()))
        }
    }

    #[test]
    fn failed_primary_decider_falls_back_to_keyword_rules() {
        let sessions = Arc::new(SessionManager::new());
        let memory = Arc::new(MemoryStore::new(
            MemoryConfig {
                long_term_path: None,
                vector_index_path: None,
                ..MemoryConfig::default()
            },
            None,
            None,
        ));
        let world = Arc::new(WorldState::new());
        let registry = Arc::new(default_registry(Arc::clone(&world), None, &[]));
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            sessions,
            memory,
            world,
            registry,
            Arc::new(FailingDecider),
        );

        let decision = orch.process_query("打开空调", QueryType::UserQuery);
        assert_eq!(decision.selected_agent, "vehicle_control_agent");
        assert!(orch.stats().failed_decisions >= 1);
    }
}
