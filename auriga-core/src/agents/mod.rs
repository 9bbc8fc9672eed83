//! Domain agents and their registry.
//!
//! An agent owns one conversational domain (vehicle control, music,
//! navigation, …). The dispatcher hands it the recognized query plus
//! session context; the agent answers with a status the session manager
//! understands: finished, needs more input, or failed.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    WaitingInput,
    Error,
}

/// What the dispatcher hands to an agent for one turn.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub query: String,
    /// The user's answer when resuming a waiting session.
    pub user_input: Option<String>,
    /// Orchestrator decision parameters and session context.
    pub context: Value,
    pub msg_id: Option<String>,
    pub session_id: Option<String>,
    /// `true` when this dispatch resumes a waiting session.
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: String,
    pub query: String,
    /// Spoken/displayed reply text.
    pub message: String,
    pub status: AgentStatus,
    pub data: Value,
}

impl AgentResponse {
    pub fn completed(agent: &str, query: &str, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            query: query.into(),
            message: message.into(),
            status: AgentStatus::Completed,
            data: Value::Null,
        }
    }

    pub fn waiting_input(agent: &str, query: &str, prompt: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            query: query.into(),
            message: prompt.into(),
            status: AgentStatus::WaitingInput,
            data: Value::Null,
        }
    }

    pub fn error(agent: &str, query: &str, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            query: query.into(),
            message: message.into(),
            status: AgentStatus::Error,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Roster entry: how the orchestrator sees an agent. Never mutated after
/// load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    /// 1..=3; 3 means the agent's sessions cannot be preempted.
    pub priority: u8,
    pub enabled: bool,
}

/// Callable tool an agent exposes (descriptor only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: Vec<ToolParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub kind: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one turn. Must not panic; long work is fine — the dispatcher
    /// runs agents off the bus thread.
    fn execute(&self, request: &AgentRequest) -> AgentResponse;

    /// Tools this agent exposes, for decision context and documentation.
    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }
}

/// Immutable-after-construction lookup of agents and their profiles.
pub struct AgentRegistry {
    profiles: Vec<AgentProfile>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            agents: HashMap::new(),
        }
    }

    pub fn register(&mut self, profile: AgentProfile, agent: Arc<dyn Agent>) {
        if self.agents.contains_key(&profile.name) {
            warn!(agent = %profile.name, "duplicate agent registration ignored");
            return;
        }
        self.agents.insert(profile.name.clone(), agent);
        self.profiles.push(profile);
    }

    pub fn enabled_profiles(&self) -> Vec<AgentProfile> {
        self.profiles.iter().filter(|p| p.enabled).cloned().collect()
    }

    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Priority used for session creation; unknown agents get the default
    /// middle priority.
    pub fn priority_of(&self, name: &str) -> u8 {
        self.profile(name).map(|p| p.priority).unwrap_or(2)
    }

    pub fn execute(&self, name: &str, request: &AgentRequest) -> AgentResponse {
        match self.agents.get(name) {
            Some(agent) if self.profile(name).is_none_or(|p| p.enabled) => agent.execute(request),
            Some(_) => AgentResponse::error(name, &request.query, format!("{name} 当前不可用")),
            None => {
                warn!(agent = name, "dispatch to unknown agent");
                AgentResponse::error(name, &request.query, format!("未找到可处理的助手：{name}"))
            }
        }
    }

    pub fn tools_of(&self, name: &str) -> Vec<ToolSpec> {
        self.agents.get(name).map(|a| a.tools()).unwrap_or_default()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
