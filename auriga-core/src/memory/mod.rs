//! Conversation memory.
//!
//! Short-term memory is a bounded list of recent turns, optionally
//! re-ranked by cosine similarity against the incoming query when an
//! embedder is configured. Long-term memory is a small JSON document
//! (summary + profile + preferences) regenerated through a [`Summarizer`]
//! hook every `trigger_count` new turns and persisted to
//! `data/long_term_memory.json`. The embedding vectors live in a JSON
//! sidecar so recall survives restarts.
//!
//! This store is single-writer: all mutation funnels through the agent
//! dispatcher after each turn.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::event::epoch_millis;
use crate::llm::{cosine_similarity, Embedder};

/// One remembered turn (user query + assistant reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMemory {
    pub query: String,
    pub response: String,
    pub timestamp_ms: u64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LongTermMetadata {
    pub last_update_ms: u64,
    pub update_count: u64,
}

/// User profile and conversation summary distilled from history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LongTermMemory {
    pub summary: String,
    pub profile: serde_json::Map<String, Value>,
    pub preferences: serde_json::Map<String, Value>,
    pub metadata: LongTermMetadata,
}

/// Distills recent turns into a fresh long-term memory document.
///
/// The production implementation prompts an LLM; the default
/// [`RollingSummarizer`] concatenates recent queries so the machinery can
/// run offline.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, turns: &[TurnMemory], previous: &LongTermMemory) -> Result<LongTermMemory>;
}

/// Offline summarizer: keeps a rolling digest of recent queries.
pub struct RollingSummarizer;

impl Summarizer for RollingSummarizer {
    fn summarize(&self, turns: &[TurnMemory], previous: &LongTermMemory) -> Result<LongTermMemory> {
        let recent: Vec<&str> = turns.iter().rev().take(5).map(|t| t.query.as_str()).collect();
        Ok(LongTermMemory {
            summary: format!("recent topics: {}", recent.join("; ")),
            profile: previous.profile.clone(),
            preferences: previous.preferences.clone(),
            metadata: LongTermMetadata {
                last_update_ms: epoch_millis(),
                update_count: previous.metadata.update_count + 1,
            },
        })
    }
}

#[derive(Serialize, Deserialize, Default)]
struct VectorIndexFile {
    entries: Vec<VectorEntry>,
}

#[derive(Serialize, Deserialize)]
struct VectorEntry {
    text: String,
    vector: Vec<f32>,
}

struct Inner {
    turns: VecDeque<TurnMemory>,
    since_regen: usize,
    long_term: LongTermMemory,
}

pub struct MemoryStore {
    config: MemoryConfig,
    inner: Mutex<Inner>,
    embedder: Option<Arc<dyn Embedder>>,
    summarizer: Arc<dyn Summarizer>,
}

impl MemoryStore {
    pub fn new(
        config: MemoryConfig,
        embedder: Option<Arc<dyn Embedder>>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let long_term = config
            .long_term_path
            .as_deref()
            .and_then(load_json::<LongTermMemory>)
            .unwrap_or_default();

        let store = Self {
            config,
            inner: Mutex::new(Inner {
                turns: VecDeque::new(),
                since_regen: 0,
                long_term,
            }),
            embedder,
            summarizer: summarizer.unwrap_or_else(|| Arc::new(RollingSummarizer)),
        };
        store.load_vector_index();
        store
    }

    /// Record one finished turn. Triggers long-term regeneration every
    /// `trigger_count` new entries.
    pub fn record_turn(&self, query: &str, response: &str) {
        let embedding = self.embed(query);

        let regen_input = {
            let mut inner = self.inner.lock();
            inner.turns.push_back(TurnMemory {
                query: query.into(),
                response: response.into(),
                timestamp_ms: epoch_millis(),
                embedding,
            });
            while inner.turns.len() > self.config.max_history_rounds {
                inner.turns.pop_front();
            }

            inner.since_regen += 1;
            if inner.since_regen >= self.config.trigger_count {
                inner.since_regen = 0;
                Some((
                    inner.turns.iter().cloned().collect::<Vec<_>>(),
                    inner.long_term.clone(),
                ))
            } else {
                None
            }
        };

        if let Some((turns, previous)) = regen_input {
            match self.summarizer.summarize(&turns, &previous) {
                Ok(updated) => {
                    info!(
                        update_count = updated.metadata.update_count,
                        "long-term memory regenerated"
                    );
                    self.inner.lock().long_term = updated.clone();
                    if let Some(path) = &self.config.long_term_path {
                        save_json(path, &updated);
                    }
                }
                Err(e) => warn!(error = %e, "long-term memory regeneration failed"),
            }
        }

        self.save_vector_index();
    }

    /// Most recent turns, newest last.
    pub fn recent_turns(&self, n: usize) -> Vec<TurnMemory> {
        let inner = self.inner.lock();
        inner.turns.iter().rev().take(n).rev().cloned().collect()
    }

    /// Turns most relevant to `query` — semantic when an embedder is
    /// configured, recency otherwise.
    pub fn related_turns(&self, query: &str, n: usize) -> Vec<TurnMemory> {
        let Some(query_vec) = self.embed(query) else {
            return self.recent_turns(n);
        };

        let inner = self.inner.lock();
        let mut scored: Vec<(f32, TurnMemory)> = inner
            .turns
            .iter()
            .filter_map(|t| {
                t.embedding
                    .as_ref()
                    .map(|e| (cosine_similarity(&query_vec, e), t.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(n).map(|(_, t)| t).collect()
    }

    pub fn long_term(&self) -> LongTermMemory {
        self.inner.lock().long_term.clone()
    }

    pub fn turn_count(&self) -> usize {
        self.inner.lock().turns.len()
    }

    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[text.to_string()]) {
            Ok(mut vecs) if !vecs.is_empty() => Some(vecs.remove(0)),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "embedding failed, falling back to recency recall");
                None
            }
        }
    }

    fn load_vector_index(&self) {
        let Some(path) = &self.config.vector_index_path else {
            return;
        };
        let Some(file) = load_json::<VectorIndexFile>(path) else {
            return;
        };
        let mut inner = self.inner.lock();
        for entry in file.entries {
            inner.turns.push_back(TurnMemory {
                query: entry.text,
                response: String::new(),
                timestamp_ms: 0,
                embedding: Some(entry.vector),
            });
        }
        while inner.turns.len() > self.config.max_history_rounds {
            inner.turns.pop_front();
        }
        debug!(turns = inner.turns.len(), "vector index loaded");
    }

    fn save_vector_index(&self) {
        let Some(path) = &self.config.vector_index_path else {
            return;
        };
        let entries: Vec<VectorEntry> = {
            let inner = self.inner.lock();
            inner
                .turns
                .iter()
                .filter_map(|t| {
                    t.embedding.as_ref().map(|e| VectorEntry {
                        text: t.query.clone(),
                        vector: e.clone(),
                    })
                })
                .collect()
        };
        save_json(path, &VectorIndexFile { entries });
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable memory file");
            None
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %e, "cannot create memory directory");
            return;
        }
    }
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!(path = %path.display(), error = %e, "memory file write failed");
            }
        }
        Err(e) => warn!(error = %e, "memory serialization failed"),
    }
}
