//! LLM backend collaborator interface
//!
//! The native text-generation backend lives behind these traits. Handles are
//! opaque loaded-model resources; the backend contract is single-threaded
//! access, enforced upstream by the engine's single-flight guard rather than
//! per-call locking.

use crate::Result;
use std::path::Path;
use std::sync::Arc;

/// A loaded LLM model. Dropping the last reference releases the native
/// resource.
pub trait LlmHandle: Send + Sync {
    /// Drive one streaming completion.
    ///
    /// `on_chunk` is invoked with each incremental text piece and whether the
    /// backend considers the response finished. Returning `false` from the
    /// callback signals the in-flight native call to stop; already-delivered
    /// chunks are unaffected.
    fn generate_streaming(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str, bool) -> bool,
    ) -> Result<()>;
}

/// Factory for LLM handles.
pub trait LlmBackend: Send + Sync {
    /// Load a model file, producing an exclusive handle. Fatal native
    /// failures (including out-of-memory) must surface as typed errors,
    /// never partially initialized handles.
    fn load(&self, path: &Path) -> Result<Arc<dyn LlmHandle>>;
}
