pub mod audio;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod speech;

pub use orchestrator::{Command, Event, OrchestratorBuilder, OrchestratorHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which kind of native model a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Llm,
    Asr,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Llm => write!(f, "LLM"),
            ModelKind::Asr => write!(f, "ASR"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParleyError {
    #[error("Microphone permission not granted")]
    PermissionDenied,

    #[error("{0} is already in progress")]
    AlreadyActive(String),

    #[error("No {0} model loaded")]
    ModelNotLoaded(ModelKind),

    #[error("Native backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ParleyError {
    /// Whether retrying the failed operation can succeed without a restart.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ParleyError::PermissionDenied => false,
            // Single-flight violation: retry once the active operation ends
            ParleyError::AlreadyActive(_) => true,
            ParleyError::ModelNotLoaded(_) => true,
            // Native library failed to initialize; permanent for this process
            ParleyError::BackendUnavailable(_) => false,
            ParleyError::DeviceError(_) => true,
            ParleyError::OutOfMemory(_) => true,
            ParleyError::InvalidInput(_) => true,
            ParleyError::Cancelled => true,
            ParleyError::Unknown(_) => true,
        }
    }

    /// Cancellation is an expected terminal state, not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ParleyError::Cancelled)
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::PermissionDenied => {
                "Microphone access denied. Grant the permission and try again.".to_string()
            }
            ParleyError::AlreadyActive(what) => {
                format!("A {} is already running. Wait for it to finish.", what)
            }
            ParleyError::ModelNotLoaded(kind) => {
                format!("No {} model is loaded. Load a model first.", kind)
            }
            ParleyError::BackendUnavailable(_) => {
                "The native inference backend is unavailable. Restart the app.".to_string()
            }
            ParleyError::DeviceError(_) => {
                "Audio device error. Please check your microphone.".to_string()
            }
            ParleyError::OutOfMemory(_) => {
                "Not enough memory. Close other apps or pick a smaller model.".to_string()
            }
            ParleyError::InvalidInput(msg) => msg.clone(),
            ParleyError::Cancelled => "Cancelled.".to_string(),
            ParleyError::Unknown(_) => "Something went wrong. Please try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
