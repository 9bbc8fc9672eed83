//! Agent session management.
//!
//! A session is a logical conversation with one agent that may span
//! multiple turns. Sessions live on a per-user stack: the top is the most
//! recent, at most one session per user is in `running` or `waiting_input`,
//! and everything below the active one is `paused`.
//!
//! Priority rules (3 is highest):
//! - a new session only preempts a strictly lower-priority one,
//! - priority-3 sessions are never paused,
//! - ties are refused — the caller surfaces that to the user.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::epoch_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    WaitingInput,
    Paused,
    Completed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub agent_name: String,
    pub state: SessionState,
    /// 1..=3, higher wins.
    pub priority: u8,
    /// Only priority-3 sessions are protected from preemption.
    pub interruptible: bool,
    /// Free-form bag carried across turns (`last_user_input` lives here).
    pub context: serde_json::Map<String, Value>,
    /// Question the agent asked before suspending.
    pub pending_prompt: Option<String>,
    pub expected_input_type: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl AgentSession {
    fn touch(&mut self) {
        self.updated_at_ms = epoch_millis();
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, AgentSession>,
    /// user id → stack of session ids, top last.
    stacks: HashMap<String, Vec<String>>,
}

/// Serialized session bookkeeping for all users.
///
/// One mutex guards everything: stacks are small and operations are short,
/// so cross-user contention is not worth a finer scheme.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `agent_name`, preempting the current one when
    /// priority allows. Returns `None` when creation is refused.
    pub fn create_session(
        &self,
        agent_name: &str,
        user_id: &str,
        priority: u8,
    ) -> Option<AgentSession> {
        let mut inner = self.inner.lock();

        if let Some(current_id) = Self::active_session_id(&mut inner, user_id) {
            let current = inner.sessions.get(&current_id).cloned()?;
            if priority > current.priority && current.priority < 3 {
                info!(
                    paused = %current.agent_name,
                    paused_priority = current.priority,
                    incoming = agent_name,
                    incoming_priority = priority,
                    "pausing session for higher-priority agent"
                );
                if let Some(s) = inner.sessions.get_mut(&current_id) {
                    s.state = SessionState::Paused;
                    s.touch();
                }
            } else {
                info!(
                    current = %current.agent_name,
                    current_priority = current.priority,
                    refused = agent_name,
                    refused_priority = priority,
                    "session creation refused by priority"
                );
                return None;
            }
        }

        let session = AgentSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            state: SessionState::Running,
            priority,
            interruptible: priority < 3,
            context: serde_json::Map::new(),
            pending_prompt: None,
            expected_input_type: None,
            created_at_ms: epoch_millis(),
            updated_at_ms: epoch_millis(),
        };

        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        inner
            .stacks
            .entry(user_id.into())
            .or_default()
            .push(session.session_id.clone());

        info!(
            agent = agent_name,
            session_id = %session.session_id,
            priority,
            interruptible = session.interruptible,
            "session created"
        );
        Some(session)
    }

    /// Topmost non-terminal session; terminal entries are popped lazily.
    pub fn get_active_session(&self, user_id: &str) -> Option<AgentSession> {
        let mut inner = self.inner.lock();
        let id = Self::active_session_id(&mut inner, user_id)?;
        inner.sessions.get(&id).cloned()
    }

    /// Transition `running → waiting_input`, storing the pending question.
    pub fn wait_for_input(&self, session_id: &str, prompt: &str, expected_type: &str) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            warn!(session_id, "wait_for_input on unknown session");
            return;
        };
        session.state = SessionState::WaitingInput;
        session.pending_prompt = Some(prompt.into());
        session.expected_input_type = Some(expected_type.into());
        session.touch();
        debug!(session_id, prompt, "session waiting for user input");
    }

    /// Transition `waiting_input → running`, recording the user's answer in
    /// the session context.
    pub fn resume_session(&self, session_id: &str, user_input: &str) -> Option<AgentSession> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(session_id)?;
        session.state = SessionState::Running;
        session.pending_prompt = None;
        session
            .context
            .insert("last_user_input".into(), Value::from(user_input));
        session.touch();
        debug!(session_id, user_input, "session resumed with user input");
        Some(session.clone())
    }

    /// Terminate a session and remove it from the user's stack. If a
    /// paused session surfaces at the top it is automatically resumed.
    /// Completing an already-terminal session is a no-op.
    pub fn complete_session(&self, session_id: &str, user_id: &str) {
        self.finish_session(session_id, user_id, SessionState::Completed)
    }

    /// Like `complete_session` but marks the session as failed. The stack
    /// treatment is identical; callers distinguish via the trace.
    pub fn fail_session(&self, session_id: &str, user_id: &str) {
        self.finish_session(session_id, user_id, SessionState::Error)
    }

    fn finish_session(&self, session_id: &str, user_id: &str, terminal: SessionState) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            warn!(session_id, "finish on unknown session");
            return;
        };
        if session.state.is_terminal() {
            debug!(session_id, "session already terminal, finish dropped");
            return;
        }
        session.state = terminal;
        session.touch();
        let agent = session.agent_name.clone();

        if let Some(stack) = inner.stacks.get_mut(user_id) {
            stack.retain(|id| id != session_id);
        }
        info!(session_id, agent = %agent, state = ?terminal, "session finished");

        // Auto-resume whatever paused session is now on top.
        let top_id = inner
            .stacks
            .get(user_id)
            .and_then(|stack| stack.last().cloned());
        if let Some(top_id) = top_id {
            if let Some(top) = inner.sessions.get_mut(&top_id) {
                if top.state == SessionState::Paused {
                    top.state = SessionState::Running;
                    top.touch();
                    info!(
                        session_id = %top_id,
                        agent = %top.agent_name,
                        "paused session auto-resumed"
                    );
                }
            }
        }
    }

    /// Pause the active session, if it allows interruption.
    pub fn pause_current_session(&self, user_id: &str) -> Option<AgentSession> {
        let mut inner = self.inner.lock();
        let id = Self::active_session_id(&mut inner, user_id)?;
        let session = inner.sessions.get_mut(&id)?;
        if !session.interruptible {
            return None;
        }
        session.state = SessionState::Paused;
        session.touch();
        Some(session.clone())
    }

    pub fn get_session(&self, session_id: &str) -> Option<AgentSession> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// Bottom-to-top snapshot of a user's stack.
    pub fn session_stack(&self, user_id: &str) -> Vec<AgentSession> {
        let inner = self.inner.lock();
        inner
            .stacks
            .get(user_id)
            .map(|stack| {
                stack
                    .iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_user_sessions(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(stack) = inner.stacks.remove(user_id) {
            for id in stack {
                inner.sessions.remove(&id);
            }
        }
    }

    // Pops terminal/vanished sessions off the top and returns the first
    // live one. Caller holds the lock.
    fn active_session_id(inner: &mut Inner, user_id: &str) -> Option<String> {
        let stack = inner.stacks.get_mut(user_id)?;
        while let Some(id) = stack.last() {
            match inner.sessions.get(id) {
                Some(s) if !s.state.is_terminal() => return Some(id.clone()),
                _ => {
                    stack.pop();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "default";

    #[test]
    fn first_session_is_created_running_on_top() {
        let mgr = SessionManager::new();
        let s = mgr.create_session("music_agent", USER, 2).unwrap();
        assert_eq!(s.state, SessionState::Running);
        assert!(s.interruptible);
        let active = mgr.get_active_session(USER).unwrap();
        assert_eq!(active.session_id, s.session_id);
    }

    #[test]
    fn equal_priority_is_refused_and_stack_unchanged() {
        let mgr = SessionManager::new();
        let a = mgr.create_session("music_agent", USER, 2).unwrap();
        assert!(mgr.create_session("weather_agent", USER, 2).is_none());
        let active = mgr.get_active_session(USER).unwrap();
        assert_eq!(active.session_id, a.session_id);
        assert_eq!(active.state, SessionState::Running);
    }

    #[test]
    fn higher_priority_pauses_current_and_completion_auto_resumes() {
        let mgr = SessionManager::new();
        let a = mgr.create_session("music_agent", USER, 2).unwrap();
        let b = mgr.create_session("vehicle_control_agent", USER, 3).unwrap();
        assert!(!b.interruptible);

        assert_eq!(
            mgr.get_session(&a.session_id).unwrap().state,
            SessionState::Paused
        );
        assert_eq!(
            mgr.get_active_session(USER).unwrap().session_id,
            b.session_id
        );

        mgr.complete_session(&b.session_id, USER);
        let resumed = mgr.get_active_session(USER).unwrap();
        assert_eq!(resumed.session_id, a.session_id);
        assert_eq!(resumed.state, SessionState::Running);
    }

    #[test]
    fn priority_three_is_never_paused() {
        let mgr = SessionManager::new();
        let top = mgr.create_session("vehicle_control_agent", USER, 3).unwrap();
        assert!(mgr.create_session("music_agent", USER, 2).is_none());
        // Even a second priority-3 request cannot preempt.
        assert!(mgr.create_session("phone_agent", USER, 3).is_none());
        assert_eq!(
            mgr.get_session(&top.session_id).unwrap().state,
            SessionState::Running
        );
        assert!(mgr.pause_current_session(USER).is_none());
    }

    #[test]
    fn at_most_one_running_or_waiting_session_per_user() {
        let mgr = SessionManager::new();
        mgr.create_session("chat_agent", USER, 1).unwrap();
        mgr.create_session("music_agent", USER, 2).unwrap();
        let c = mgr.create_session("vehicle_control_agent", USER, 3).unwrap();
        mgr.wait_for_input(&c.session_id, "which window?", "text");

        let active: Vec<_> = mgr
            .session_stack(USER)
            .into_iter()
            .filter(|s| matches!(s.state, SessionState::Running | SessionState::WaitingInput))
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, c.session_id);
    }

    #[test]
    fn waiting_input_round_trip_stores_the_answer() {
        let mgr = SessionManager::new();
        let s = mgr.create_session("workflow_agent", USER, 2).unwrap();
        mgr.wait_for_input(&s.session_id, "哪个城市？", "text");

        let waiting = mgr.get_active_session(USER).unwrap();
        assert_eq!(waiting.state, SessionState::WaitingInput);
        assert_eq!(waiting.pending_prompt.as_deref(), Some("哪个城市？"));

        let resumed = mgr.resume_session(&s.session_id, "北京").unwrap();
        assert_eq!(resumed.state, SessionState::Running);
        assert!(resumed.pending_prompt.is_none());
        assert_eq!(resumed.context["last_user_input"], Value::from("北京"));
    }

    #[test]
    fn double_complete_is_a_no_op() {
        let mgr = SessionManager::new();
        let a = mgr.create_session("music_agent", USER, 2).unwrap();
        let b = mgr.create_session("vehicle_control_agent", USER, 3).unwrap();
        mgr.complete_session(&b.session_id, USER);
        assert_eq!(
            mgr.get_active_session(USER).unwrap().session_id,
            a.session_id
        );
        // Second completion must not disturb the resumed session.
        mgr.complete_session(&b.session_id, USER);
        assert_eq!(
            mgr.get_active_session(USER).unwrap().state,
            SessionState::Running
        );
    }

    #[test]
    fn failed_sessions_leave_the_stack_like_completed_ones() {
        let mgr = SessionManager::new();
        let a = mgr.create_session("music_agent", USER, 2).unwrap();
        let b = mgr.create_session("vehicle_control_agent", USER, 3).unwrap();
        mgr.fail_session(&b.session_id, USER);
        assert_eq!(
            mgr.get_session(&b.session_id).unwrap().state,
            SessionState::Error
        );
        assert_eq!(
            mgr.get_active_session(USER).unwrap().session_id,
            a.session_id
        );
    }

    #[test]
    fn terminal_sessions_are_popped_lazily() {
        let mgr = SessionManager::new();
        let a = mgr.create_session("music_agent", USER, 2).unwrap();
        // Mark terminal without removing from the stack.
        mgr.inner.lock().sessions.get_mut(&a.session_id).unwrap().state = SessionState::Completed;
        assert!(mgr.get_active_session(USER).is_none());
        assert!(mgr.session_stack(USER).is_empty());
    }

    #[test]
    fn users_have_independent_stacks() {
        let mgr = SessionManager::new();
        mgr.create_session("music_agent", "driver", 2).unwrap();
        let p = mgr.create_session("music_agent", "passenger", 2).unwrap();
        assert_eq!(
            mgr.get_active_session("passenger").unwrap().session_id,
            p.session_id
        );
        mgr.clear_user_sessions("driver");
        assert!(mgr.get_active_session("driver").is_none());
        assert!(mgr.get_active_session("passenger").is_some());
    }
}
