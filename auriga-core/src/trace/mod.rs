//! Per-turn message tracing.
//!
//! Every conversation turn gets a unique id (`msg_<ms-epoch>_<8-hex>`) when
//! the pipeline first encounters it — the wake-word worker for voice turns,
//! the orchestrator for injected text. Each stage appends an ordered record
//! of its input/output; completing a trace stamps `end_time` and appends
//! the whole turn as one JSON line to
//! `logs/message_traces/traces_YYYY-MM-DD.jsonl`.
//!
//! Disk failures are logged and swallowed — tracing must never take the
//! pipeline down.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::epoch_millis;

/// How a turn entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Wakeword,
    TextInput,
}

/// One stage record inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    pub module: String,
    pub event_type: String,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// The full audit record of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTrace {
    pub msg_id: String,
    pub session_type: TurnSource,
    pub start_time_ms: u64,
    pub query: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    pub stages: Vec<StageTrace>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl MessageTrace {
    /// Total turn duration; measured against now while still open.
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms
            .unwrap_or_else(epoch_millis)
            .saturating_sub(self.start_time_ms)
    }
}

pub struct MessageTracker {
    traces: Mutex<HashMap<String, MessageTrace>>,
    log_dir: Option<PathBuf>,
}

impl MessageTracker {
    /// `log_dir = None` disables file logging (in-memory only).
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "cannot create trace log directory, file logging disabled");
                return Self {
                    traces: Mutex::new(HashMap::new()),
                    log_dir: None,
                };
            }
        }
        Self {
            traces: Mutex::new(HashMap::new()),
            log_dir,
        }
    }

    /// Mint a turn id and open its trace.
    pub fn create_message_id(
        &self,
        session_type: TurnSource,
        metadata: serde_json::Map<String, Value>,
    ) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        let msg_id = format!("msg_{}_{:08x}", epoch_millis(), suffix);

        let trace = MessageTrace {
            msg_id: msg_id.clone(),
            session_type,
            start_time_ms: epoch_millis(),
            query: String::new(),
            response: String::new(),
            end_time_ms: None,
            stages: Vec::new(),
            metadata,
        };
        self.traces.lock().insert(msg_id.clone(), trace);

        debug!(msg_id = %msg_id, session_type = ?session_type, "turn opened");
        msg_id
    }

    /// Append a stage record. Unknown ids are logged and dropped.
    pub fn add_trace(
        &self,
        msg_id: &str,
        module: &str,
        event_type: &str,
        input: Option<Value>,
        output: Option<Value>,
        metadata: serde_json::Map<String, Value>,
    ) {
        let mut traces = self.traces.lock();
        let Some(trace) = traces.get_mut(msg_id) else {
            warn!(msg_id, module, event_type, "stage dropped: unknown msg_id");
            return;
        };
        trace.stages.push(StageTrace {
            module: module.into(),
            event_type: event_type.into(),
            timestamp_ms: epoch_millis(),
            input,
            output,
            metadata,
        });
    }

    pub fn update_query(&self, msg_id: &str, query: &str) {
        if let Some(trace) = self.traces.lock().get_mut(msg_id) {
            trace.query = query.into();
        }
    }

    pub fn update_response(&self, msg_id: &str, response: &str) {
        if let Some(trace) = self.traces.lock().get_mut(msg_id) {
            trace.response = response.into();
        }
    }

    /// Stamp `end_time`, log a summary and append the turn to today's file.
    pub fn complete_trace(&self, msg_id: &str) {
        let completed = {
            let mut traces = self.traces.lock();
            let Some(trace) = traces.get_mut(msg_id) else {
                warn!(msg_id, "complete dropped: unknown msg_id");
                return;
            };
            if trace.end_time_ms.is_some() {
                debug!(msg_id, "trace already completed");
                return;
            }
            trace.end_time_ms = Some(epoch_millis());
            trace.clone()
        };

        info!(
            msg_id = %completed.msg_id,
            session_type = ?completed.session_type,
            query = %completed.query,
            response = %truncate(&completed.response, 100),
            duration_ms = completed.duration_ms(),
            stages = completed.stages.len(),
            "turn completed"
        );

        self.append_to_file(&completed);
    }

    pub fn get_trace(&self, msg_id: &str) -> Option<MessageTrace> {
        self.traces.lock().get(msg_id).cloned()
    }

    /// Most recent traces first.
    pub fn get_recent_traces(&self, count: usize) -> Vec<MessageTrace> {
        let traces = self.traces.lock();
        let mut all: Vec<MessageTrace> = traces.values().cloned().collect();
        all.sort_by(|a, b| b.start_time_ms.cmp(&a.start_time_ms));
        all.truncate(count);
        all
    }

    /// Drop in-memory traces older than `max_age_hours`.
    pub fn cleanup_old_traces(&self, max_age_hours: u64) -> usize {
        let cutoff = epoch_millis().saturating_sub(max_age_hours * 3_600_000);
        let mut traces = self.traces.lock();
        let before = traces.len();
        traces.retain(|_, t| t.start_time_ms >= cutoff);
        let removed = before - traces.len();
        if removed > 0 {
            debug!(removed, "old traces cleaned up");
        }
        removed
    }

    fn append_to_file(&self, trace: &MessageTrace) {
        let Some(dir) = &self.log_dir else {
            return;
        };

        let date = Local
            .timestamp_millis_opt(trace.start_time_ms as i64)
            .single()
            .unwrap_or_else(Local::now)
            .format("%Y-%m-%d");
        let path = dir.join(format!("traces_{date}.jsonl"));

        let line = match serde_json::to_string(&TraceFileRecord::from(trace)) {
            Ok(line) => line,
            Err(e) => {
                warn!(msg_id = %trace.msg_id, error = %e, "trace serialization failed");
                return;
            }
        };

        // Open-append-write-close keeps each turn atomic at line granularity.
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "trace file append failed");
        }
    }
}

/// On-disk shape: the in-memory trace plus the derived duration.
#[derive(Serialize)]
struct TraceFileRecord<'a> {
    #[serde(flatten)]
    trace: &'a MessageTrace,
    duration_ms: u64,
}

impl<'a> From<&'a MessageTrace> for TraceFileRecord<'a> {
    fn from(trace: &'a MessageTrace) -> Self {
        Self {
            trace,
            duration_ms: trace.duration_ms(),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect::<String>() + "…"
    }
}
