//! Built-in domain agents.
//!
//! Each handler covers one domain with a small rule surface — enough to
//! drive the simulated vehicle and exercise every dispatcher path
//! (completed, waiting-input, error). Tool descriptors are exposed for the
//! decision context.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{Agent, AgentProfile, AgentRegistry, AgentRequest, AgentResponse, ToolParam, ToolSpec};
use crate::llm::{ChatMessage, ChatModel, ChatOptions};
use crate::world::WorldState;

/// Free-form conversation, lowest priority.
pub struct ChatAgent {
    model: Option<Arc<dyn ChatModel>>,
}

impl ChatAgent {
    pub fn new(model: Option<Arc<dyn ChatModel>>) -> Self {
        Self { model }
    }
}

impl Agent for ChatAgent {
    fn name(&self) -> &str {
        "chat_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let reply = match &self.model {
            Some(model) => {
                let messages = [
                    ChatMessage::system("你是车载语音助手，回答要简短口语化，适合朗读。"),
                    ChatMessage::user(&request.query),
                ];
                match model.chat(&messages, &ChatOptions::default()) {
                    Ok(completion) => completion.content,
                    Err(_) => "我在呢，不过这个问题我暂时答不上来。".to_string(),
                }
            }
            None => "我在呢，有什么可以帮您？".to_string(),
        };
        AgentResponse::completed(self.name(), &request.query, reply)
    }
}

/// Relays orchestrator notices (e.g. "a higher-priority task is active").
pub struct SystemAgent;

impl Agent for SystemAgent {
    fn name(&self) -> &str {
        "system_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let message = request
            .context
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or("系统正忙，请稍后再试。")
            .to_string();
        AgentResponse::completed(self.name(), &request.query, message)
    }
}

/// Cabin controls: HVAC and windows. Priority 3 — never preempted.
pub struct VehicleControlAgent {
    world: Arc<WorldState>,
}

impl VehicleControlAgent {
    pub fn new(world: Arc<WorldState>) -> Self {
        Self { world }
    }
}

impl Agent for VehicleControlAgent {
    fn name(&self) -> &str {
        "vehicle_control_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let query = request.query.as_str();
        let turn_on = query.contains("打开") || query.contains("开启");
        let turn_off = query.contains("关闭") || query.contains("关掉") || query.contains("关上");

        if query.contains("空调") {
            if turn_on || turn_off {
                self.world.update(|v| v.hvac.power = turn_on);
                let message = if turn_on { "好的，空调已打开。" } else { "好的，空调已关闭。" };
                return AgentResponse::completed(self.name(), query, message)
                    .with_data(json!({ "tool": "hvac_power", "on": turn_on }));
            }
            if query.contains("调高") || query.contains("调低") {
                let delta = if query.contains("调高") { 1.0 } else { -1.0 };
                let temperature = self.world.update(|v| {
                    v.hvac.temperature_c = (v.hvac.temperature_c + delta).clamp(16.0, 30.0);
                    v.hvac.temperature_c
                });
                return AgentResponse::completed(
                    self.name(),
                    query,
                    format!("已将温度调整到{temperature}度。"),
                )
                .with_data(json!({ "tool": "hvac_temperature", "temperature_c": temperature }));
            }
        }

        if query.contains("车窗") && (turn_on || turn_off) {
            let pct = if turn_on { 100 } else { 0 };
            self.world.update(|v| {
                v.windows.driver_open_pct = pct;
                v.windows.passenger_open_pct = pct;
            });
            let message = if turn_on { "好的，车窗已打开。" } else { "好的，车窗已关闭。" };
            return AgentResponse::completed(self.name(), query, message)
                .with_data(json!({ "tool": "window_position", "open_pct": pct }));
        }

        AgentResponse::completed(self.name(), query, "抱歉，我还不支持这个车辆操作。")
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "hvac_power".into(),
                description: "Turn the air conditioning on or off".into(),
                category: "hvac".into(),
                parameters: vec![ToolParam {
                    name: "on".into(),
                    kind: "boolean".into(),
                    required: true,
                    allowed: None,
                    default: None,
                }],
            },
            ToolSpec {
                name: "hvac_temperature".into(),
                description: "Adjust the cabin target temperature".into(),
                category: "hvac".into(),
                parameters: vec![ToolParam {
                    name: "direction".into(),
                    kind: "string".into(),
                    required: true,
                    allowed: Some(vec!["up".into(), "down".into()]),
                    default: None,
                }],
            },
            ToolSpec {
                name: "window_position".into(),
                description: "Open or close the cabin windows".into(),
                category: "body".into(),
                parameters: vec![ToolParam {
                    name: "open_pct".into(),
                    kind: "integer".into(),
                    required: false,
                    allowed: None,
                    default: Some(json!(100)),
                }],
            },
        ]
    }
}

pub struct MusicAgent {
    world: Arc<WorldState>,
}

impl MusicAgent {
    pub fn new(world: Arc<WorldState>) -> Self {
        Self { world }
    }
}

impl Agent for MusicAgent {
    fn name(&self) -> &str {
        "music_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let query = request.query.as_str();
        if query.contains("停止") || query.contains("暂停") {
            self.world.update(|v| v.media.playing = false);
            return AgentResponse::completed(self.name(), query, "音乐已暂停。");
        }
        self.world.update(|v| {
            v.media.playing = true;
            if v.media.track.is_none() {
                v.media.track = Some("随机播放".into());
            }
        });
        AgentResponse::completed(self.name(), query, "好的，正在为您播放音乐。")
    }
}

/// Navigation: completes when a destination is recognizable, otherwise
/// suspends and asks for one.
pub struct NavigationAgent {
    world: Arc<WorldState>,
}

impl NavigationAgent {
    pub fn new(world: Arc<WorldState>) -> Self {
        Self { world }
    }

    fn extract_destination(query: &str) -> Option<String> {
        for marker in ["导航到", "导航去", "去", "到"] {
            if let Some(idx) = query.find(marker) {
                let rest = query[idx + marker.len()..].trim();
                if !rest.is_empty() {
                    return Some(rest.trim_end_matches(['。', '！', '？']).to_string());
                }
            }
        }
        None
    }
}

impl Agent for NavigationAgent {
    fn name(&self) -> &str {
        "navigation_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let destination = request
            .user_input
            .clone()
            .or_else(|| Self::extract_destination(&request.query));

        match destination {
            Some(dest) => {
                self.world.update(|v| {
                    v.navigation.destination = Some(dest.clone());
                    v.navigation.navigating = true;
                });
                AgentResponse::completed(self.name(), &request.query, format!("好的，开始导航到{dest}。"))
                    .with_data(json!({ "destination": dest }))
            }
            None => AgentResponse::waiting_input(self.name(), &request.query, "请问要去哪里？"),
        }
    }
}

pub struct WeatherAgent;

impl Agent for WeatherAgent {
    fn name(&self) -> &str {
        "weather_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        // Weather data comes from outside the core; this handler keeps the
        // domain routable end-to-end.
        AgentResponse::completed(
            self.name(),
            &request.query,
            "今天多云转晴，气温二十二到二十八度，适合开窗通风。",
        )
    }
}

/// Multi-turn demo agent: always asks a follow-up before finishing.
pub struct WorkflowAgent;

impl Agent for WorkflowAgent {
    fn name(&self) -> &str {
        "workflow_agent"
    }

    fn execute(&self, request: &AgentRequest) -> AgentResponse {
        match &request.user_input {
            Some(answer) if request.resume => AgentResponse::completed(
                self.name(),
                &request.query,
                format!("好的，已按「{answer}」继续执行任务。"),
            )
            .with_data(json!({ "answer": answer })),
            _ => AgentResponse::waiting_input(self.name(), &request.query, "哪个城市？"),
        }
    }
}

/// Default roster matching the built-in handlers.
pub fn default_profiles() -> Vec<AgentProfile> {
    let profile = |name: &str, description: &str, capabilities: &[&str], priority: u8| AgentProfile {
        name: name.into(),
        description: description.into(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        priority,
        enabled: true,
    };
    vec![
        profile("chat_agent", "Small talk and everything unrouted", &["chat"], 1),
        profile("system_agent", "System notices to the user", &["notice"], 1),
        profile("music_agent", "Music playback control", &["play", "pause"], 2),
        profile(
            "navigation_agent",
            "Route planning and guidance",
            &["navigate"],
            2,
        ),
        profile("weather_agent", "Weather information", &["forecast"], 2),
        profile(
            "workflow_agent",
            "Multi-step tasks that collect follow-up input",
            &["workflow"],
            2,
        ),
        profile(
            "vehicle_control_agent",
            "Cabin controls: HVAC, windows",
            &["hvac", "windows"],
            3,
        ),
    ]
}

/// Build a registry with the default roster wired to `world`.
///
/// `profiles` overrides the roster (matching handlers by name); pass an
/// empty slice to use the defaults.
pub fn default_registry(
    world: Arc<WorldState>,
    chat_model: Option<Arc<dyn ChatModel>>,
    profiles: &[AgentProfile],
) -> AgentRegistry {
    let roster = if profiles.is_empty() {
        default_profiles()
    } else {
        profiles.to_vec()
    };

    let mut registry = AgentRegistry::new();
    for profile in roster {
        let agent: Arc<dyn Agent> = match profile.name.as_str() {
            "chat_agent" => Arc::new(ChatAgent::new(chat_model.clone())),
            "system_agent" => Arc::new(SystemAgent),
            "music_agent" => Arc::new(MusicAgent::new(Arc::clone(&world))),
            "navigation_agent" => Arc::new(NavigationAgent::new(Arc::clone(&world))),
            "weather_agent" => Arc::new(WeatherAgent),
            "workflow_agent" => Arc::new(WorkflowAgent),
            "vehicle_control_agent" => Arc::new(VehicleControlAgent::new(Arc::clone(&world))),
            other => {
                tracing::warn!(agent = other, "no handler for configured agent, skipped");
                continue;
            }
        };
        registry.register(profile, agent);
    }
    registry
}
