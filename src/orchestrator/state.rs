//! Externally observable state
//!
//! One snapshot struct, mutated only by the orchestrator thread and published
//! atomically: readers clone it under the same lock the writer holds, so a
//! torn snapshot is impossible.

use crate::llm::GenerationMetrics;
use crate::metrics::{InferenceStats, SystemSnapshot};
use crate::speech::TranscriptionResult;
use crate::ParleyError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

/// One entry in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RecordingPhase {
    #[default]
    Idle,
    Recording,
    Transcribing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum ModelPhase {
    #[default]
    Unloaded,
    Loading {
        name: String,
    },
    Loaded {
        name: String,
    },
}

impl ModelPhase {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelPhase::Loaded { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ModelPhase::Loading { .. })
    }
}

/// The single externally visible snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Conversation log; append-only while a session is running
    pub messages: Vec<Message>,

    /// Streamed text of the in-progress generation
    pub streaming_output: String,

    pub is_generating: bool,
    pub recording: RecordingPhase,
    pub llm_model: ModelPhase,
    pub asr_model: ModelPhase,

    /// Most recent microphone amplitude, [0, 1]
    pub audio_level: f32,

    pub last_transcription: Option<TranscriptionResult>,

    /// Metrics of the latest generation (live while streaming)
    pub generation: GenerationMetrics,

    /// Aggregated session statistics
    pub inference: InferenceStats,

    /// Latest host resource readings
    pub system: SystemSnapshot,

    /// Most recent error; cleared when a new operation starts
    pub last_error: Option<ParleyError>,
}

/// Shared handle to the published snapshot.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Snapshot>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the current snapshot. Never observes a partial update.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().clone()
    }

    /// Apply one serialized mutation. Only the orchestrator thread calls this.
    pub(crate) fn update(&self, mutate: impl FnOnce(&mut Snapshot)) {
        let mut snapshot = self.inner.lock();
        mutate(&mut snapshot);
    }
}
