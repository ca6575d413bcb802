//! Speech-recognition backend collaborator interface

use crate::Result;
use std::path::Path;
use std::sync::Arc;

/// A loaded speech model. The native contract is exclusive access; callers
/// serialize transcriptions onto one worker instead of locking per call.
pub trait AsrHandle: Send + Sync {
    /// Transcribe normalized f32 PCM in [-1, 1] to text.
    fn transcribe(&self, samples: &[f32]) -> Result<String>;
}

/// Factory for speech handles.
pub trait SpeechBackend: Send + Sync {
    /// Whether the native library initialized at process start. A `false`
    /// here is permanent for the process lifetime.
    fn is_available(&self) -> bool;

    /// Human-readable cause when `is_available()` is false
    fn load_error(&self) -> Option<String> {
        None
    }

    /// Load a model file, producing an exclusive handle.
    fn load(&self, path: &Path) -> Result<Arc<dyn AsrHandle>>;
}
