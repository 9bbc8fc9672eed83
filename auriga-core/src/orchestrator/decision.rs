//! Agent-selection deciders.
//!
//! Two interchangeable implementations sit behind [`DecisionMaker`]: an
//! LLM-backed decider that must return strict JSON, and a deterministic
//! keyword decider used for tests and as the fallback when LLM calls fail.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Decision, DecisionContext};
use crate::error::{AurigaError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatOptions};

/// How an utterance relates to a pending agent question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The utterance answers the pending prompt.
    Answer,
    /// The utterance opens a new request.
    NewIntent,
}

pub trait DecisionMaker: Send + Sync {
    fn decide(&self, context: &DecisionContext) -> Result<Decision>;

    /// Classify an utterance arriving while a session waits for input.
    fn classify_reply(&self, query: &str, pending_prompt: &str, expected_type: &str) -> ReplyKind {
        let _ = expected_type;
        rule_classify_reply(query, pending_prompt)
    }
}

/// Marker words that almost always open a fresh request.
const NEW_INTENT_MARKERS: [&str; 13] = [
    "打开", "关闭", "播放", "停止", "导航", "去", "到", "设置", "调节", "查询", "帮我", "我要",
    "请",
];

/// Utterances at least this long must overlap the pending prompt to count
/// as answers.
const SHORT_REPLY_CHARS: usize = 10;

/// Keyword rule: command markers mean a new intent; short utterances are
/// answers to the pending question; longer ones are answers only when they
/// share vocabulary with the prompt.
pub fn rule_classify_reply(query: &str, pending_prompt: &str) -> ReplyKind {
    if NEW_INTENT_MARKERS.iter().any(|kw| query.contains(kw)) {
        return ReplyKind::NewIntent;
    }
    if query.chars().count() < SHORT_REPLY_CHARS {
        return ReplyKind::Answer;
    }
    let prompt_chars: std::collections::HashSet<char> = pending_prompt
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    if query.chars().any(|c| prompt_chars.contains(&c)) {
        ReplyKind::Answer
    } else {
        ReplyKind::NewIntent
    }
}

/// Deterministic keyword decider. First matching keyword wins, so order
/// encodes precedence.
pub struct RuleDecisionMaker {
    rules: Vec<(&'static str, &'static str)>,
    default_agent: String,
}

impl RuleDecisionMaker {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            rules: vec![
                ("音乐", "music_agent"),
                ("歌", "music_agent"),
                ("播放", "music_agent"),
                ("导航", "navigation_agent"),
                ("路线", "navigation_agent"),
                ("去", "navigation_agent"),
                ("天气", "weather_agent"),
                ("车窗", "vehicle_control_agent"),
                ("空调", "vehicle_control_agent"),
                ("温度", "vehicle_control_agent"),
                ("座椅", "vehicle_control_agent"),
                ("车门", "vehicle_control_agent"),
                ("订", "workflow_agent"),
                ("行程", "workflow_agent"),
            ],
            default_agent: default_agent.into(),
        }
    }
}

impl DecisionMaker for RuleDecisionMaker {
    fn decide(&self, context: &DecisionContext) -> Result<Decision> {
        let query = context.query.as_str();
        let enabled = |name: &str| context.agents.iter().any(|a| a.name == name && a.enabled);

        for (keyword, agent) in &self.rules {
            if query.contains(keyword) && enabled(agent) {
                debug!(keyword, agent, "keyword rule matched");
                return Ok(Decision {
                    selected_agent: (*agent).to_string(),
                    confidence: 0.9,
                    reasoning: format!("matched keyword '{keyword}'"),
                    parameters: serde_json::Map::new(),
                    session_id: None,
                    session_action: None,
                });
            }
        }

        Ok(Decision {
            selected_agent: self.default_agent.clone(),
            confidence: 0.5,
            reasoning: "no keyword matched, default agent".into(),
            parameters: serde_json::Map::new(),
            session_id: None,
            session_action: None,
        })
    }
}

/// Strict-JSON shape the LLM must return.
#[derive(Debug, Serialize, Deserialize)]
struct RawDecision {
    selected_agent: String,
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

pub struct LlmDecisionMaker {
    model: Arc<dyn ChatModel>,
}

impl LlmDecisionMaker {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    fn build_prompt(context: &DecisionContext) -> String {
        let agents: Vec<Value> = context
            .agents
            .iter()
            .filter(|a| a.enabled)
            .map(|a| {
                serde_json::json!({
                    "name": a.name,
                    "description": a.description,
                    "capabilities": a.capabilities,
                })
            })
            .collect();
        let history: Vec<Value> = context
            .short_term
            .iter()
            .map(|t| serde_json::json!({ "user": t.query, "assistant": t.response }))
            .collect();
        let states: Vec<Value> = context
            .world
            .iter()
            .map(|s| serde_json::json!({ "type": s.kind, "data": s.data }))
            .collect();

        format!(
            "你是智能车载助手的决策中心，需要根据用户查询和上下文选择最合适的Agent。\n\n\
             **用户当前查询：**\n{query}\n\n\
             **对话历史：**\n{history}\n\n\
             **用户画像摘要：**\n{summary}\n\n\
             **车辆状态：**\n{states}\n\n\
             **可用的Agents：**\n{agents}\n\n\
             **决策要求：**\n\
             1. 仔细分析用户查询的意图\n\
             2. 考虑对话历史和用户偏好\n\
             3. 从可用的Agents中选择最合适的一个\n\
             4. 如果查询不明确或无法处理，选择\"chat_agent\"\n\n\
             **输出格式（必须是有效的JSON）：**\n\
             {{\"selected_agent\": \"...\", \"confidence\": 0.95, \"reasoning\": \"...\", \"parameters\": {{}}}}\n\n\
             只返回JSON，不要包含其他文字。",
            query = context.query,
            history = serde_json::to_string(&history).unwrap_or_default(),
            summary = context.long_term.summary,
            states = serde_json::to_string(&states).unwrap_or_default(),
            agents = serde_json::to_string_pretty(&agents).unwrap_or_default(),
        )
    }
}

impl DecisionMaker for LlmDecisionMaker {
    fn decide(&self, context: &DecisionContext) -> Result<Decision> {
        let messages = [
            ChatMessage::system("你是一个专业的智能决策系统，负责分析用户意图并选择合适的Agent处理请求。"),
            ChatMessage::user(Self::build_prompt(context)),
        ];
        let options = ChatOptions {
            temperature: Some(0.3),
            json_mode: true,
            ..ChatOptions::default()
        };

        let completion = self.model.chat(&messages, &options)?;
        let raw: RawDecision = serde_json::from_str(completion.content.trim())
            .map_err(|e| AurigaError::Llm(format!("decision is not valid JSON: {e}")))?;

        Ok(Decision {
            selected_agent: raw.selected_agent,
            confidence: raw.confidence.clamp(0.0, 1.0),
            reasoning: raw.reasoning,
            parameters: raw.parameters,
            session_id: None,
            session_action: None,
        })
    }

    fn classify_reply(&self, query: &str, pending_prompt: &str, expected_type: &str) -> ReplyKind {
        let messages = [
            ChatMessage::system(
                "你是意图分类专家。用户刚被问了一个问题，现在给出了回复。\
                 判断回复是 answer（回答之前的问题）还是 new_intent（新的请求）。\
                 只返回 answer 或 new_intent。",
            ),
            ChatMessage::user(format!(
                "之前的问题：{pending_prompt}\n期望的回答类型：{expected_type}\n用户的回复：{query}"
            )),
        ];
        let options = ChatOptions {
            temperature: Some(0.1),
            max_tokens: Some(10),
            ..ChatOptions::default()
        };
        match self.model.chat(&messages, &options) {
            Ok(completion) if completion.content.to_lowercase().contains("new") => {
                ReplyKind::NewIntent
            }
            Ok(_) => ReplyKind::Answer,
            Err(e) => {
                warn!(error = %e, "reply classification failed, assuming answer");
                ReplyKind::Answer
            }
        }
    }
}
