pub mod backend;
pub mod transcriber;

pub use backend::{AsrHandle, SpeechBackend};
pub use transcriber::{TranscribeRequest, Transcriber, TranscriptionResult};
