//! Agent dispatcher.
//!
//! Consumes `AGENT_DISPATCH_REQUEST` events, runs the chosen agent on its
//! own thread (agents may block on LLM or tool calls) and translates the
//! reply into session-manager transitions:
//!
//! - `WAITING_INPUT` → `wait_for_input` (the session stays open)
//! - `COMPLETED` → `complete_session`
//! - `ERROR` → the session is likewise closed; the trace tells them apart
//!
//! The dispatcher never creates or resumes sessions (that is the
//! orchestrator's side of the split), never retries a failed agent, and
//! forwards every non-empty reply as exactly one GUI update and one TTS
//! request. It also closes the turn: response recorded into short-term
//! memory, trace completed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agents::{AgentRegistry, AgentRequest, AgentStatus};
use crate::bus::SystemController;
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType, SessionAction, TtsPriority};
use crate::memory::MemoryStore;
use crate::module::Module;
use crate::session::SessionManager;
use crate::trace::MessageTracker;

pub struct AgentDispatcher {
    controller: Arc<SystemController>,
    tracker: Arc<MessageTracker>,
    sessions: Arc<SessionManager>,
    registry: Arc<AgentRegistry>,
    memory: Arc<MemoryStore>,
    user_id: String,
    running: AtomicBool,
    dispatched: AtomicU64,
}

impl AgentDispatcher {
    pub const NAME: &'static str = "agent_dispatcher";

    pub fn new(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        sessions: Arc<SessionManager>,
        registry: Arc<AgentRegistry>,
        memory: Arc<MemoryStore>,
        user_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            tracker,
            sessions,
            registry,
            memory,
            user_id: user_id.into(),
            running: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
        })
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_agent(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        sessions: Arc<SessionManager>,
        registry: Arc<AgentRegistry>,
        memory: Arc<MemoryStore>,
        user_id: String,
        agent_name: String,
        query: String,
        context: Value,
        msg_id: Option<String>,
        session_id: Option<String>,
        session_action: Option<SessionAction>,
    ) {
        info!(
            agent = %agent_name,
            query = %query,
            session_id = session_id.as_deref().unwrap_or(""),
            action = ?session_action,
            "dispatching agent"
        );

        if let Some(id) = &msg_id {
            tracker.add_trace(
                id,
                Self::NAME,
                "agent_execution_start",
                Some(json!({ "agent_name": agent_name, "query": query })),
                None,
                serde_json::Map::new(),
            );
        }

        let request = AgentRequest {
            query: query.clone(),
            user_input: context
                .get("user_input")
                .and_then(Value::as_str)
                .map(String::from),
            context,
            msg_id: msg_id.clone(),
            session_id: session_id.clone(),
            resume: session_action == Some(SessionAction::Resume),
        };

        let response = registry.execute(&agent_name, &request);

        match response.status {
            AgentStatus::WaitingInput => {
                if let Some(session_id) = &session_id {
                    sessions.wait_for_input(session_id, &response.message, "text");
                } else {
                    warn!(agent = %agent_name, "waiting-input reply without a session");
                }
            }
            AgentStatus::Completed => {
                if let Some(session_id) = &session_id {
                    sessions.complete_session(session_id, &user_id);
                }
            }
            AgentStatus::Error => {
                if let Some(session_id) = &session_id {
                    sessions.fail_session(session_id, &user_id);
                }
            }
        }

        if let Some(id) = &msg_id {
            tracker.add_trace(
                id,
                &agent_name,
                "agent_response",
                None,
                Some(json!({
                    "message": response.message,
                    "status": response.status,
                    "data": response.data,
                })),
                serde_json::Map::new(),
            );
            tracker.update_response(id, &response.message);
        }

        // Completed turns feed the conversation history; a pending
        // question is not a finished exchange yet.
        if response.status == AgentStatus::Completed {
            memory.record_turn(&query, &response.message);
        }

        controller.publish(
            Event::new(
                EventType::GuiUpdateText,
                Self::NAME,
                EventPayload::GuiText {
                    kind: "agent_response".into(),
                    body: serde_json::to_value(&response).unwrap_or(Value::Null),
                },
            )
            .with_msg_id(msg_id.clone()),
        );

        if !response.message.is_empty() {
            controller.publish(
                Event::new(
                    EventType::TtsSpeakRequest,
                    Self::NAME,
                    EventPayload::TtsRequest {
                        text: response.message.clone(),
                        priority: TtsPriority::High,
                    },
                )
                .with_msg_id(msg_id.clone()),
            );
            if let Some(id) = &msg_id {
                tracker.add_trace(
                    id,
                    "tts",
                    "tts_request",
                    Some(json!({ "text": response.message })),
                    None,
                    serde_json::Map::new(),
                );
            }
        }

        if let Some(id) = &msg_id {
            tracker.complete_trace(id);
        }
    }
}

impl Module for AgentDispatcher {
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
                EventType::AgentDispatchRequest,
                EventPayload::AgentRequest {
                    agent_name,
                    query,
                    context,
                    ..
                },
            ) => {
                if agent_name.is_empty() || query.is_empty() {
                    warn!("dispatch request without agent or query, dropped");
                    return;
                }
                self.dispatched.fetch_add(1, Ordering::Relaxed);

                let controller = Arc::clone(&self.controller);
                let tracker = Arc::clone(&self.tracker);
                let sessions = Arc::clone(&self.sessions);
                let registry = Arc::clone(&self.registry);
                let memory = Arc::clone(&self.memory);
                let user_id = self.user_id.clone();
                let agent_name = agent_name.clone();
                let query = query.clone();
                let context = context.clone();
                let msg_id = event.msg_id.clone();
                let session_id = event.session_id.clone();
                let session_action = event.session_action;

                // Agents may run for seconds; never block the bus.
                std::thread::spawn(move || {
                    Self::run_agent(
                        controller,
                        tracker,
                        sessions,
                        registry,
                        memory,
                        user_id,
                        agent_name,
                        query,
                        context,
                        msg_id,
                        session_id,
                        session_action,
                    )
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
