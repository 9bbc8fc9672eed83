use thiserror::Error;

/// All errors produced by auriga-core.
#[derive(Debug, Error)]
pub enum AurigaError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("module '{name}' is already registered")]
    ModuleAlreadyRegistered { name: String },

    #[error("module '{name}' failed to initialize: {reason}")]
    ModuleInit { name: String, reason: String },

    #[error("module '{name}' failed to start: {reason}")]
    ModuleStart { name: String, reason: String },

    #[error("system is already running")]
    AlreadyRunning,

    #[error("system is not running")]
    NotRunning,

    #[error("engine error: {0}")]
    Engine(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AurigaError>;
