pub mod backend;
pub mod session;

pub use backend::{LlmBackend, LlmHandle};
pub use session::{CancelToken, GenerationEvent, GenerationMetrics, GenerationSession, LlmEngine};
