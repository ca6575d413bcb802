//! One-shot transcription serialized onto a single worker
//!
//! The speech backend requires exclusive access to its handle, so all
//! transcription requests funnel through one worker thread and are served
//! strictly in submission order, never interleaved.

use crate::config::TranscribeConfig;
use crate::speech::backend::AsrHandle;
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one transcription call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    /// Transcribed text, trimmed
    pub text: String,

    /// Length of the input audio in milliseconds
    pub audio_duration_ms: u64,

    /// Wall-clock time the backend spent transcribing
    pub processing_time_ms: u64,
}

impl TranscriptionResult {
    /// Processing time relative to audio length; < 1.0 is faster than realtime
    pub fn realtime_factor(&self) -> f32 {
        if self.audio_duration_ms == 0 {
            return 0.0;
        }
        self.processing_time_ms as f32 / self.audio_duration_ms as f32
    }
}

/// A transcription request carrying its own handle reference, so model
/// ownership stays with the orchestrator.
pub struct TranscribeRequest {
    pub handle: Option<Arc<dyn AsrHandle>>,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Worker front-end: submit requests, receive results in the same order.
pub struct Transcriber {
    request_tx: Option<Sender<TranscribeRequest>>,
    result_rx: Receiver<Result<TranscriptionResult>>,
    worker: Option<JoinHandle<()>>,
}

impl Transcriber {
    pub fn spawn(config: TranscribeConfig) -> Self {
        let (request_tx, request_rx) = bounded::<TranscribeRequest>(16);
        let (result_tx, result_rx) = bounded::<Result<TranscriptionResult>>(16);

        let worker = std::thread::spawn(move || {
            info!("Transcription worker ready");
            for request in request_rx.iter() {
                let outcome = transcribe_one(&config, request);
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("Transcription worker stopped");
        });

        Self {
            request_tx: Some(request_tx),
            result_rx,
            worker: Some(worker),
        }
    }

    /// Queue a request. A request submitted while another is in flight runs
    /// strictly after it.
    pub fn submit(&self, request: TranscribeRequest) -> Result<()> {
        self.request_tx
            .as_ref()
            .ok_or_else(|| ParleyError::Unknown("Transcription worker is gone".into()))?
            .send(request)
            .map_err(|_| ParleyError::Unknown("Transcription worker is gone".into()))
    }

    /// Result channel, usable in `select!` loops
    pub fn results(&self) -> Receiver<Result<TranscriptionResult>> {
        self.result_rx.clone()
    }
}

impl Drop for Transcriber {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop
        self.request_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn transcribe_one(
    config: &TranscribeConfig,
    request: TranscribeRequest,
) -> Result<TranscriptionResult> {
    let handle = request
        .handle
        .ok_or(ParleyError::ModelNotLoaded(crate::ModelKind::Asr))?;

    if request.samples.is_empty() {
        return Err(ParleyError::InvalidInput("Audio data is empty".into()));
    }

    if request.sample_rate != config.expected_sample_rate {
        if config.strict_sample_rate {
            return Err(ParleyError::InvalidInput(format!(
                "Audio is {}Hz but the backend expects {}Hz",
                request.sample_rate, config.expected_sample_rate
            )));
        }
        // Accuracy degrades gracefully rather than erroring
        warn!(
            "Audio is {}Hz but the backend expects {}Hz. Results may vary.",
            request.sample_rate, config.expected_sample_rate
        );
    }

    let audio_duration_ms = (request.samples.len() as u64 * 1000) / request.sample_rate as u64;
    debug!(
        "Transcribing {} samples ({:.1}s of audio)",
        request.samples.len(),
        audio_duration_ms as f32 / 1000.0
    );

    let start = Instant::now();
    let text = handle.transcribe(&request.samples)?;
    let processing_time_ms = start.elapsed().as_millis() as u64;

    let result = TranscriptionResult {
        text: text.trim().to_string(),
        audio_duration_ms,
        processing_time_ms,
    };

    debug!(
        "Transcription complete in {}ms ({:.2}x realtime)",
        processing_time_ms,
        result.realtime_factor()
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns a fixed text; asserts it is never entered concurrently.
    struct FakeAsr {
        text: String,
        busy: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeAsr {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                busy: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl AsrHandle for FakeAsr {
        fn transcribe(&self, _samples: &[f32]) -> Result<String> {
            assert!(
                !self.busy.swap(true, Ordering::SeqCst),
                "handle entered concurrently"
            );
            std::thread::sleep(Duration::from_millis(10));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            Ok(self.text.clone())
        }
    }

    fn request(handle: Option<Arc<dyn AsrHandle>>, samples: usize) -> TranscribeRequest {
        TranscribeRequest {
            handle,
            samples: vec![0.0; samples],
            sample_rate: 16_000,
        }
    }

    #[test]
    fn test_transcribe_result_fields() {
        let transcriber = Transcriber::spawn(TranscribeConfig::default());
        let handle = FakeAsr::new("  hello world  ");

        transcriber.submit(request(Some(handle), 16_000)).unwrap();
        let result = transcriber.results().recv().unwrap().unwrap();

        assert_eq!(result.text, "hello world");
        assert_eq!(result.audio_duration_ms, 1000);
    }

    #[test]
    fn test_empty_input_rejected() {
        let transcriber = Transcriber::spawn(TranscribeConfig::default());
        let handle = FakeAsr::new("x");

        transcriber.submit(request(Some(handle), 0)).unwrap();
        let result = transcriber.results().recv().unwrap();

        assert!(matches!(result, Err(ParleyError::InvalidInput(_))));
    }

    #[test]
    fn test_missing_handle_rejected() {
        let transcriber = Transcriber::spawn(TranscribeConfig::default());

        transcriber.submit(request(None, 16_000)).unwrap();
        let result = transcriber.results().recv().unwrap();

        assert_eq!(
            result,
            Err(ParleyError::ModelNotLoaded(crate::ModelKind::Asr))
        );
    }

    #[test]
    fn test_sample_rate_mismatch_is_lenient_by_default() {
        let transcriber = Transcriber::spawn(TranscribeConfig::default());
        let handle = FakeAsr::new("ok");

        let mut req = request(Some(handle), 8_000);
        req.sample_rate = 8_000;
        transcriber.submit(req).unwrap();

        let result = transcriber.results().recv().unwrap().unwrap();
        assert_eq!(result.text, "ok");
    }

    #[test]
    fn test_sample_rate_mismatch_strict() {
        let config = TranscribeConfig {
            strict_sample_rate: true,
            ..TranscribeConfig::default()
        };
        let transcriber = Transcriber::spawn(config);
        let handle = FakeAsr::new("ok");

        let mut req = request(Some(handle), 8_000);
        req.sample_rate = 8_000;
        transcriber.submit(req).unwrap();

        assert!(matches!(
            transcriber.results().recv().unwrap(),
            Err(ParleyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_requests_serialize_fifo() {
        let transcriber = Transcriber::spawn(TranscribeConfig::default());
        let first = FakeAsr::new("first");
        let second = FakeAsr::new("second");

        transcriber
            .submit(request(Some(Arc::clone(&first) as Arc<dyn AsrHandle>), 160))
            .unwrap();
        transcriber
            .submit(request(Some(second), 160))
            .unwrap();

        let results = transcriber.results();
        assert_eq!(results.recv().unwrap().unwrap().text, "first");
        assert_eq!(results.recv().unwrap().unwrap().text, "second");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }
}
