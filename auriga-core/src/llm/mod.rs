//! LLM and embedding access.
//!
//! The orchestrator and the chat agent talk to models only through
//! [`ChatModel`] / [`Embedder`]. `HttpChatModel` speaks the
//! OpenAI-compatible chat-completions wire format (the same shape the
//! DashScope / Groq / Mistral gateways expose); `MockChatModel` is the
//! deterministic offline stand-in.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AurigaError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the endpoint for a strict JSON object response.
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub total_tokens: u64,
}

pub trait ChatModel: Send + Sync {
    fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatCompletion>;
}

pub trait Embedder: Send + Sync {
    /// One vector per input text. All vectors have the same dimension.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Blocking OpenAI-compatible chat completions client.
///
/// The `reqwest::blocking` client is created per call: callers always run
/// on plain worker threads, and constructing a blocking client inside an
/// async runtime would panic.
pub struct HttpChatModel {
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpChatModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl ChatModel for HttpChatModel {
    fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if options.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let client = reqwest::blocking::Client::new();
        let resp = client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| AurigaError::Llm(format!("http error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AurigaError::Llm(format!("http status: {status}")));
        }

        let val: Value = resp
            .json()
            .map_err(|e| AurigaError::Llm(format!("json error: {e}")))?;
        let content = val["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        if content.trim().is_empty() {
            return Err(AurigaError::Llm("empty completion".into()));
        }
        let total_tokens = val["usage"]["total_tokens"].as_u64().unwrap_or(0);

        Ok(ChatCompletion {
            content,
            total_tokens,
        })
    }
}

/// Deterministic offline model: replies from a canned table or echoes.
#[derive(Default)]
pub struct MockChatModel {
    /// `(needle, reply)` pairs checked in order against the last user turn.
    pub replies: Vec<(String, String)>,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies.push((needle.into(), reply.into()));
        self
    }
}

impl ChatModel for MockChatModel {
    fn chat(&self, messages: &[ChatMessage], _options: &ChatOptions) -> Result<ChatCompletion> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let content = self
            .replies
            .iter()
            .find(|(needle, _)| last_user.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| format!("收到：{last_user}"));

        Ok(ChatCompletion {
            content,
            total_tokens: 0,
        })
    }
}

/// Cheap deterministic embedder: token hashes folded into a fixed-size
/// vector. Good enough for cosine-similarity plumbing and tests.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vec = vec![0f32; self.dimension];
                for (i, ch) in text.chars().enumerate() {
                    let bucket = (ch as usize).wrapping_mul(31).wrapping_add(i) % self.dimension;
                    vec[bucket] += 1.0;
                }
                let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in &mut vec {
                        *v /= norm;
                    }
                }
                vec
            })
            .collect())
    }
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_model_matches_needles_in_order() {
        let model = MockChatModel::new()
            .with_reply("空调", "空调已打开")
            .with_reply("音乐", "正在播放");
        let out = model
            .chat(&[ChatMessage::user("请打开空调")], &ChatOptions::default())
            .unwrap();
        assert_eq!(out.content, "空调已打开");

        let out = model
            .chat(&[ChatMessage::user("没有匹配")], &ChatOptions::default())
            .unwrap();
        assert!(out.content.contains("没有匹配"));
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed(&["打开空调".into()]).unwrap();
        let b = embedder.embed(&["打开空调".into()]).unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated_ones() {
        let embedder = HashEmbedder::new(64);
        let vecs = embedder
            .embed(&[
                "打开空调".into(),
                "把空调打开".into(),
                "navigate to the airport".into(),
            ])
            .unwrap();
        let close = cosine_similarity(&vecs[0], &vecs[1]);
        let far = cosine_similarity(&vecs[0], &vecs[2]);
        assert!(close > far, "close={close} far={far}");
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
