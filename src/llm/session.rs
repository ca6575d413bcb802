//! Streaming generation sessions with cooperative cancellation
//!
//! A session is a channel-backed producer: a worker thread drives the
//! backend's callback API and forwards `(chunk, metrics)` events; the consumer
//! iterates the receiver and can cancel at any point via a shared token.

use crate::llm::backend::{LlmBackend, LlmHandle};
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Running figures for one generation, recomputed on every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct GenerationMetrics {
    /// Time to first non-empty chunk, latched once per session
    pub ttft: Duration,

    /// Chunks emitted so far; monotonically non-decreasing within a session
    pub tokens_generated: u32,

    /// Wall-clock time since the call began
    pub elapsed: Duration,

    /// Throughput; 0 when no time has elapsed yet
    pub tokens_per_second: f32,
}

impl GenerationMetrics {
    pub fn compute(ttft: Duration, tokens_generated: u32, elapsed: Duration) -> Self {
        let tokens_per_second = if elapsed.is_zero() {
            0.0
        } else {
            tokens_generated as f32 / elapsed.as_secs_f32()
        };
        Self {
            ttft,
            tokens_generated,
            elapsed,
            tokens_per_second,
        }
    }

    pub fn ttft_ms(&self) -> f64 {
        self.ttft.as_secs_f64() * 1000.0
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Shared cancellation flag for one session.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Events emitted by a generation session
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// An incremental text chunk with running metrics
    Chunk {
        text: String,
        metrics: GenerationMetrics,
    },

    /// The backend signalled completion
    Done { metrics: GenerationMetrics },

    /// The backend failed mid-stream; chunks delivered so far stand
    Error(ParleyError),
}

/// Consumer side of one streaming generation.
///
/// The event channel closes when the worker exits; a cancelled session ends
/// without a terminal `Done` event.
pub struct GenerationSession {
    rx: Receiver<GenerationEvent>,
    cancel: CancelToken,
}

impl GenerationSession {
    /// Receiver for this session's events, usable in `select!` loops
    pub fn events(&self) -> Receiver<GenerationEvent> {
        self.rx.clone()
    }

    /// Signal the in-flight native call to stop. Partial output already
    /// delivered is retained by the caller; the session does not resume.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block for the next event; `None` once the session has ended
    pub fn recv(&self) -> Option<GenerationEvent> {
        self.rx.recv().ok()
    }
}

/// Owns the loaded LLM handle and enforces single-flight generation.
pub struct LlmEngine {
    backend: Arc<dyn LlmBackend>,
    handle: Option<Arc<dyn LlmHandle>>,
    model_name: Option<String>,
    in_flight: Arc<AtomicBool>,
}

impl LlmEngine {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            backend,
            handle: None,
            model_name: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load a model through the backend. Blocks; run it off the hot path.
    pub fn load_handle(&self, path: &Path) -> Result<Arc<dyn LlmHandle>> {
        self.backend.load(path)
    }

    /// The backend this engine loads handles from
    pub fn backend(&self) -> Arc<dyn LlmBackend> {
        Arc::clone(&self.backend)
    }

    /// Install a freshly loaded handle, dropping (and thereby releasing) any
    /// previous one.
    pub fn install(&mut self, handle: Arc<dyn LlmHandle>, model_name: String) {
        self.handle = Some(handle);
        self.model_name = Some(model_name);
    }

    /// Drop the current handle. The native resource is released once the last
    /// reference (possibly held briefly by a cancelled worker) goes away.
    pub fn unload(&mut self) {
        self.handle = None;
        self.model_name = None;
        debug!("LLM model unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn is_generating(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a streaming generation.
    ///
    /// Fails before producing any chunk with `ModelNotLoaded` when no handle
    /// is installed, or `AlreadyActive` when a generation is still in flight
    /// against this handle.
    pub fn generate(&self, prompt: &str) -> Result<GenerationSession> {
        let handle = self
            .handle
            .as_ref()
            .ok_or(ParleyError::ModelNotLoaded(crate::ModelKind::Llm))?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ParleyError::AlreadyActive("generation".into()));
        }

        let (tx, rx) = bounded::<GenerationEvent>(256);
        let cancel = CancelToken::new();

        let handle = Arc::clone(handle);
        let in_flight = Arc::clone(&self.in_flight);
        let worker_cancel = cancel.clone();
        let prompt = prompt.to_string();

        std::thread::spawn(move || {
            run_generation(handle, &prompt, tx, worker_cancel);
            in_flight.store(false, Ordering::SeqCst);
        });

        Ok(GenerationSession { rx, cancel })
    }
}

fn run_generation(
    handle: Arc<dyn LlmHandle>,
    prompt: &str,
    tx: Sender<GenerationEvent>,
    cancel: CancelToken,
) {
    let start = Instant::now();
    let mut ttft: Option<Duration> = None;
    let mut tokens: u32 = 0;

    let chunk_tx = tx.clone();
    let chunk_cancel = cancel.clone();

    let mut on_chunk = |text: &str, is_final: bool| -> bool {
        if chunk_cancel.is_cancelled() {
            return false;
        }

        if !text.is_empty() {
            // TTFT latches on the first non-empty chunk only
            let ttft = *ttft.get_or_insert_with(|| start.elapsed());
            tokens += 1;

            let metrics = GenerationMetrics::compute(ttft, tokens, start.elapsed());
            if chunk_tx
                .send(GenerationEvent::Chunk {
                    text: text.to_string(),
                    metrics,
                })
                .is_err()
            {
                // Consumer withdrew interest; stop the native call
                return false;
            }
        }

        !is_final
    };

    match handle.generate_streaming(prompt, &mut on_chunk) {
        Ok(()) => {
            if cancel.is_cancelled() {
                debug!("Generation cancelled after {} tokens", tokens);
                return;
            }
            let metrics =
                GenerationMetrics::compute(ttft.unwrap_or_default(), tokens, start.elapsed());
            debug!(
                "Generation complete: {} tokens in {:.0}ms",
                tokens,
                metrics.elapsed_ms()
            );
            let _ = tx.send(GenerationEvent::Done { metrics });
        }
        Err(e) => {
            error!("Generation failed: {}", e);
            let _ = tx.send(GenerationEvent::Error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Streams a fixed script of chunks with a small delay between them.
    struct ScriptedHandle {
        chunks: Vec<String>,
        delay: Duration,
    }

    impl ScriptedHandle {
        fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|s| s.to_string()).collect(),
                delay: Duration::from_millis(2),
            }
        }
    }

    impl LlmHandle for ScriptedHandle {
        fn generate_streaming(
            &self,
            _prompt: &str,
            on_chunk: &mut dyn FnMut(&str, bool) -> bool,
        ) -> Result<()> {
            for chunk in &self.chunks {
                std::thread::sleep(self.delay);
                if !on_chunk(chunk, false) {
                    return Ok(());
                }
            }
            on_chunk("", true);
            Ok(())
        }
    }

    /// Streams the same chunk forever until told to stop.
    struct EndlessHandle;

    impl LlmHandle for EndlessHandle {
        fn generate_streaming(
            &self,
            _prompt: &str,
            on_chunk: &mut dyn FnMut(&str, bool) -> bool,
        ) -> Result<()> {
            loop {
                std::thread::sleep(Duration::from_millis(1));
                if !on_chunk("tok", false) {
                    return Ok(());
                }
            }
        }
    }

    struct FailingHandle;

    impl LlmHandle for FailingHandle {
        fn generate_streaming(
            &self,
            _prompt: &str,
            on_chunk: &mut dyn FnMut(&str, bool) -> bool,
        ) -> Result<()> {
            on_chunk("partial", false);
            Err(ParleyError::Unknown("native decode failure".into()))
        }
    }

    struct StaticBackend(Arc<dyn LlmHandle>);

    impl LlmBackend for StaticBackend {
        fn load(&self, _path: &Path) -> Result<Arc<dyn LlmHandle>> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn engine_with(handle: Arc<dyn LlmHandle>) -> LlmEngine {
        let mut engine = LlmEngine::new(Arc::new(StaticBackend(Arc::clone(&handle))));
        engine.install(handle, "test-model".into());
        engine
    }

    #[test]
    fn test_model_not_loaded() {
        let engine = LlmEngine::new(Arc::new(StaticBackend(Arc::new(EndlessHandle))));
        assert_eq!(
            engine.generate("hi").err(),
            Some(ParleyError::ModelNotLoaded(crate::ModelKind::Llm))
        );
    }

    #[test]
    fn test_streaming_chunks_in_order() {
        let engine = engine_with(Arc::new(ScriptedHandle::new(&["Hi", " there"])));
        let session = engine.generate("hello").unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(event) = session.recv() {
            match event {
                GenerationEvent::Chunk { text: chunk, .. } => text.push_str(&chunk),
                GenerationEvent::Done { metrics } => {
                    assert_eq!(metrics.tokens_generated, 2);
                    done = true;
                }
                GenerationEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(text, "Hi there");
        assert!(done);
    }

    #[test]
    fn test_ttft_latched_on_first_nonempty_chunk() {
        // Leading empty chunk must not latch TTFT or count as a token
        let engine = engine_with(Arc::new(ScriptedHandle::new(&["", "a", "b", "c"])));
        let session = engine.generate("hello").unwrap();

        let mut ttfts = Vec::new();
        while let Some(event) = session.recv() {
            if let GenerationEvent::Chunk { metrics, .. } = event {
                assert!(metrics.tokens_per_second >= 0.0);
                ttfts.push(metrics.ttft);
            }
        }

        assert_eq!(ttfts.len(), 3);
        assert!(ttfts[0] > Duration::ZERO);
        // Latched: later chunks carry the same TTFT
        assert!(ttfts.iter().all(|&t| t == ttfts[0]));
    }

    #[test]
    fn test_zero_elapsed_reports_zero_throughput() {
        let metrics = GenerationMetrics::compute(Duration::ZERO, 5, Duration::ZERO);
        assert_eq!(metrics.tokens_per_second, 0.0);
    }

    #[test]
    fn test_second_generate_fails_fast() {
        let engine = engine_with(Arc::new(EndlessHandle));
        let session = engine.generate("first").unwrap();

        // Wait until the first session is producing
        let first = session.recv();
        assert!(matches!(first, Some(GenerationEvent::Chunk { .. })));

        assert_eq!(
            engine.generate("second").err(),
            Some(ParleyError::AlreadyActive("generation".into()))
        );

        // The in-flight session keeps streaming unaffected
        assert!(matches!(
            session.recv(),
            Some(GenerationEvent::Chunk { .. })
        ));
        session.cancel();
    }

    #[test]
    fn test_cancellation_preserves_partial_output() {
        let engine = engine_with(Arc::new(EndlessHandle));
        let session = engine.generate("prompt").unwrap();

        let mut received = 0;
        while received < 3 {
            match session.recv() {
                Some(GenerationEvent::Chunk { .. }) => received += 1,
                other => panic!("unexpected event: {:?}", other),
            }
        }

        session.cancel();

        // The stream ends without a Done event; late chunks may still arrive
        // but the channel must close once the backend observes the token
        let mut saw_done = false;
        while let Some(event) = session.recv() {
            if matches!(event, GenerationEvent::Done { .. }) {
                saw_done = true;
            }
        }
        assert!(!saw_done);

        // Single-flight slot is released once the worker exits
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.is_generating() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_generating());
    }

    #[test]
    fn test_backend_error_terminates_stream() {
        let engine = engine_with(Arc::new(FailingHandle));
        let session = engine.generate("prompt").unwrap();

        let mut saw_error = false;
        let mut partial = String::new();
        while let Some(event) = session.recv() {
            match event {
                GenerationEvent::Chunk { text, .. } => partial.push_str(&text),
                GenerationEvent::Error(ParleyError::Unknown(_)) => saw_error = true,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(saw_error);
        assert_eq!(partial, "partial");
    }

    #[test]
    fn test_unload_while_cancelled_worker_drains() {
        let mut engine = engine_with(Arc::new(EndlessHandle));
        let session = engine.generate("prompt").unwrap();
        assert!(matches!(
            session.recv(),
            Some(GenerationEvent::Chunk { .. })
        ));

        session.cancel();
        engine.unload();
        assert!(!engine.is_loaded());

        // Draining after unload is safe; the worker still holds its own Arc
        while session.recv().is_some() {}
    }
}
