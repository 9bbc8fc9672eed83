//! # auriga-core
//!
//! Event-driven in-car voice assistant core.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioWorker ──frame──▶ SystemController (bus)
//!     ├─▶ WakeWordWorker ──detected──▶ VoiceStateMachine
//!     ├─▶ VadWorker ──speech_end+pcm──▶ AsrWorker ──text──▶ Orchestrator
//!     └─▶ Orchestrator ──dispatch──▶ AgentDispatcher ──reply──▶ TTS, GUI
//! ```
//!
//! Workers communicate only through bus events; the session manager,
//! message tracker, memory and world state are explicit services shared by
//! reference. Engine backends (wake word, VAD, ASR, TTS, LLM) sit behind
//! small traits with built-in offline defaults.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod agents;
pub mod audio;
pub mod buffering;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod engines;
pub mod error;
pub mod event;
pub mod llm;
pub mod memory;
pub mod module;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod trace;
pub mod workers;
pub mod world;

// Convenience re-exports for downstream crates
pub use agents::{Agent, AgentRegistry, AgentResponse, AgentStatus};
pub use bus::SystemController;
pub use config::AurigaConfig;
pub use dispatch::AgentDispatcher;
pub use error::{AurigaError, Result};
pub use event::{Event, EventPayload, EventType};
pub use module::Module;
pub use orchestrator::{Decision, Orchestrator, OrchestratorWorker};
pub use session::{AgentSession, SessionManager, SessionState};
pub use state::{StateConfig, VoiceState, VoiceStateMachine};
pub use trace::{MessageTracker, TurnSource};
pub use world::WorldState;
