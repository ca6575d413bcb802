//! Orchestrator: the single writer of externally observable state
//!
//! Concurrent producers (generation stream, amplitude callbacks, transcription
//! results, model-load workers, sampler ticks) all funnel into one loop that
//! serializes every state mutation and enforces the single-flight invariants:
//! at most one generation, one recording, one load per model kind.

pub mod state;

pub use state::{Message, ModelPhase, RecordingPhase, Role, SharedState, Snapshot};

use crate::audio::capture::AudioCapture;
use crate::audio::device::AudioDevice;
use crate::audio::pcm_to_f32;
use crate::config::OrchestratorConfig;
use crate::llm::backend::{LlmBackend, LlmHandle};
use crate::llm::session::{GenerationEvent, GenerationMetrics, GenerationSession, LlmEngine};
use crate::metrics::{
    HostTelemetry, InferenceMetrics, ProcTelemetry, SamplerWorker, SystemSampler, SystemSnapshot,
};
use crate::speech::backend::{AsrHandle, SpeechBackend};
use crate::speech::transcriber::{TranscribeRequest, Transcriber, TranscriptionResult};
use crate::{ModelKind, ParleyError, Result};
use crossbeam_channel::{bounded, never, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Commands accepted from the presentation layer
#[derive(Debug, Clone)]
pub enum Command {
    /// Start a streaming generation for the given prompt
    SendPrompt(String),

    /// Cancel the in-flight generation, keeping partial output
    StopGeneration,

    /// Start capturing microphone audio
    StartRecording,

    /// Stop capturing and transcribe the recorded buffer
    StopRecordingAndTranscribe,

    /// Load a model file, replacing any currently loaded one of that kind
    LoadModel { path: PathBuf, kind: ModelKind },

    /// Drop the loaded model of the given kind
    UnloadModel(ModelKind),

    /// Clear the conversation log and reset aggregated metrics
    ClearConversation,

    /// Shut the orchestrator down
    Shutdown,
}

/// Events emitted toward the presentation layer.
///
/// Events are advisory; the snapshot is the authoritative state.
#[derive(Debug, Clone)]
pub enum Event {
    RecordingStarted,
    RecordingStopped,
    Amplitude(f32),
    Transcription(TranscriptionResult),
    GenerationStarted,
    Token(String),
    GenerationComplete {
        response: String,
        metrics: GenerationMetrics,
    },
    GenerationAborted {
        partial: String,
    },
    ModelLoaded(ModelKind),
    ModelUnloaded(ModelKind),
    Error(ParleyError),
    Shutdown,
}

/// Marker appended to partial output when the user aborts a generation
pub const ABORTED_MARKER: &str = " [ABORTED]";

enum LoadOutcome {
    Llm {
        name: String,
        result: Result<Arc<dyn LlmHandle>>,
    },
    Asr {
        name: String,
        result: Result<Arc<dyn AsrHandle>>,
    },
}

/// Handle for controlling the orchestrator from the presentation layer
pub struct OrchestratorHandle {
    command_tx: Sender<Command>,
    event_rx: Receiver<Event>,
    state: SharedState,
    worker: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Send a command to the orchestrator
    pub fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ParleyError::Unknown("Orchestrator is gone".into()))
    }

    /// Clone the current state snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    /// Try to receive an event without blocking
    pub fn try_recv_event(&self) -> Option<Event> {
        self.event_rx.try_recv().ok()
    }

    /// Wait for the next event, up to `timeout`
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<Event> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Event receiver for select-style consumption
    pub fn events(&self) -> Receiver<Event> {
        self.event_rx.clone()
    }

    /// Request shutdown and join the orchestrator thread.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Builder wiring the collaborator implementations together
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    llm_backend: Option<Arc<dyn LlmBackend>>,
    speech_backend: Option<Arc<dyn SpeechBackend>>,
    device: Option<Arc<dyn AudioDevice>>,
    telemetry: Option<Arc<dyn HostTelemetry>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            llm_backend: None,
            speech_backend: None,
            device: None,
            telemetry: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_llm_backend(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.llm_backend = Some(backend);
        self
    }

    pub fn with_speech_backend(mut self, backend: Arc<dyn SpeechBackend>) -> Self {
        self.speech_backend = Some(backend);
        self
    }

    pub fn with_audio_device(mut self, device: Arc<dyn AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn HostTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validate the wiring and start the orchestrator thread.
    pub fn spawn(self) -> Result<OrchestratorHandle> {
        self.config.validate()?;

        let llm_backend = self
            .llm_backend
            .ok_or_else(|| ParleyError::InvalidInput("An LLM backend is required".into()))?;
        let speech_backend = self
            .speech_backend
            .ok_or_else(|| ParleyError::InvalidInput("A speech backend is required".into()))?;

        let device = match self.device {
            Some(device) => device,
            None => default_device()?,
        };
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(ProcTelemetry::new()));

        Ok(Orchestrator::spawn(
            self.config,
            llm_backend,
            speech_backend,
            device,
            telemetry,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "audio-io")]
fn default_device() -> Result<Arc<dyn AudioDevice>> {
    Ok(Arc::new(crate::audio::device::CpalMicrophone::new()))
}

#[cfg(not(feature = "audio-io"))]
fn default_device() -> Result<Arc<dyn AudioDevice>> {
    Err(ParleyError::InvalidInput(
        "An audio device is required when the audio-io feature is disabled".into(),
    ))
}

struct Orchestrator {
    config: OrchestratorConfig,

    llm: LlmEngine,
    speech_backend: Arc<dyn SpeechBackend>,
    asr_handle: Option<Arc<dyn AsrHandle>>,
    asr_available: bool,

    capture: AudioCapture,
    transcriber: Transcriber,
    metrics: InferenceMetrics,
    telemetry: Arc<dyn HostTelemetry>,

    state: SharedState,
    command_rx: Receiver<Command>,
    event_tx: Sender<Event>,

    amp_tx: Sender<f32>,
    amp_rx: Receiver<f32>,

    load_tx: Sender<LoadOutcome>,
    load_rx: Receiver<LoadOutcome>,

    sampler_rx: Receiver<SystemSnapshot>,
    sampler: Option<SamplerWorker>,

    generation: Option<GenerationSession>,
}

impl Orchestrator {
    fn spawn(
        config: OrchestratorConfig,
        llm_backend: Arc<dyn LlmBackend>,
        speech_backend: Arc<dyn SpeechBackend>,
        device: Arc<dyn AudioDevice>,
        telemetry: Arc<dyn HostTelemetry>,
    ) -> OrchestratorHandle {
        let (command_tx, command_rx) = bounded(100);
        let (event_tx, event_rx) = bounded(100);
        let (amp_tx, amp_rx) = bounded(32);
        let (load_tx, load_rx) = bounded(4);
        let (sampler_tx, sampler_rx) = bounded(8);

        let state = SharedState::new();

        let sampler = if config.enable_sampler {
            Some(SamplerWorker::spawn(
                SystemSampler::new(Arc::clone(&telemetry)),
                Duration::from_millis(config.sampler_interval_ms),
                sampler_tx,
            ))
        } else {
            None
        };

        let asr_available = speech_backend.is_available();
        if !asr_available {
            warn!(
                "Speech backend unavailable: {}",
                speech_backend
                    .load_error()
                    .unwrap_or_else(|| "unknown cause".into())
            );
        }

        let orchestrator = Orchestrator {
            capture: AudioCapture::new(device, config.audio.clone()),
            transcriber: Transcriber::spawn(config.transcribe.clone()),
            config,
            llm: LlmEngine::new(llm_backend),
            speech_backend,
            asr_handle: None,
            asr_available,
            metrics: InferenceMetrics::new(),
            telemetry,
            state: state.clone(),
            command_rx,
            event_tx,
            amp_tx,
            amp_rx,
            load_tx,
            load_rx,
            sampler_rx,
            sampler,
            generation: None,
        };

        let worker = std::thread::spawn(move || orchestrator.run());

        OrchestratorHandle {
            command_tx,
            event_rx,
            state,
            worker: Some(worker),
        }
    }

    fn run(mut self) {
        info!("Orchestrator started");

        // Local clones keep the select arms free to borrow self mutably
        let command_rx = self.command_rx.clone();
        let amp_rx = self.amp_rx.clone();
        let load_rx = self.load_rx.clone();
        let sampler_rx = self.sampler_rx.clone();
        let transcription_rx = self.transcriber.results();

        loop {
            let generation_rx = self
                .generation
                .as_ref()
                .map(|session| session.events())
                .unwrap_or_else(never);

            crossbeam_channel::select! {
                recv(command_rx) -> msg => match msg {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(generation_rx) -> msg => self.on_generation_event(msg.ok()),
                recv(amp_rx) -> msg => {
                    if let Ok(level) = msg {
                        self.state.update(|s| s.audio_level = level);
                        self.emit(Event::Amplitude(level));
                    }
                },
                recv(transcription_rx) -> msg => {
                    if let Ok(outcome) = msg {
                        self.on_transcription(outcome);
                    }
                },
                recv(load_rx) -> msg => {
                    if let Ok(outcome) = msg {
                        self.on_load_outcome(outcome);
                    }
                },
                recv(sampler_rx) -> msg => {
                    if let Ok(sample) = msg {
                        self.state.update(|s| s.system = sample);
                    }
                },
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        trace!("Command: {:?}", command);
        match command {
            Command::SendPrompt(prompt) => self.send_prompt(prompt),
            Command::StopGeneration => self.stop_generation(),
            Command::StartRecording => self.start_recording(),
            Command::StopRecordingAndTranscribe => self.stop_recording_and_transcribe(),
            Command::LoadModel { path, kind } => self.load_model(&path, kind),
            Command::UnloadModel(kind) => self.unload_model(kind),
            Command::ClearConversation => self.clear_conversation(),
            Command::Shutdown => unreachable!("handled in the loop"),
        }
    }

    // ---- generation ----

    fn send_prompt(&mut self, prompt: String) {
        if prompt.trim().is_empty() {
            return;
        }

        if self.generation.is_some() {
            // Fail fast; the in-flight session is untouched
            self.report_error(ParleyError::AlreadyActive("generation".into()));
            return;
        }

        match self.llm.generate(&prompt) {
            Ok(session) => {
                debug!("Generation started for prompt of {} chars", prompt.len());
                self.metrics.start_session(prompt.len());
                self.state.update(|s| {
                    s.messages.push(Message::user(&prompt));
                    s.streaming_output.clear();
                    s.is_generating = true;
                    s.generation = GenerationMetrics::default();
                    s.last_error = None;
                });
                self.generation = Some(session);
                self.emit(Event::GenerationStarted);
            }
            Err(e) => self.report_error(e),
        }
    }

    fn on_generation_event(&mut self, event: Option<GenerationEvent>) {
        match event {
            Some(GenerationEvent::Chunk { text, metrics }) => {
                self.metrics.record_first_token();
                self.metrics.record_token();
                let stats = self.metrics.get_stats();
                self.state.update(|s| {
                    s.streaming_output.push_str(&text);
                    s.generation = metrics;
                    s.inference = stats;
                });
                self.emit(Event::Token(text));
            }
            Some(GenerationEvent::Done { metrics }) => {
                self.generation = None;
                self.metrics.end_session();
                let stats = self.metrics.get_stats();

                let mut response = String::new();
                self.state.update(|s| {
                    response = std::mem::take(&mut s.streaming_output);
                    s.messages.push(Message::assistant(&response));
                    s.is_generating = false;
                    s.generation = metrics;
                    s.inference = stats;
                });

                debug!("Generation complete: {} chars", response.len());
                self.emit(Event::GenerationComplete { response, metrics });
            }
            Some(GenerationEvent::Error(e)) => {
                self.generation = None;
                self.metrics.cancel_session();
                // Failed sessions drop their partial output; the error is
                // what the user needs to see
                self.state.update(|s| {
                    s.streaming_output.clear();
                    s.is_generating = false;
                });
                self.report_error(e);
            }
            None => {
                // Stream closed without a terminal event: worker died
                if self.generation.take().is_some() {
                    self.metrics.cancel_session();
                    self.state.update(|s| {
                        s.streaming_output.clear();
                        s.is_generating = false;
                    });
                    self.report_error(ParleyError::Unknown(
                        "Generation worker exited unexpectedly".into(),
                    ));
                }
            }
        }
    }

    fn stop_generation(&mut self) {
        let Some(session) = self.generation.take() else {
            return;
        };

        // Cooperative cancel; dropping the receiver guarantees no further
        // state updates from this session, even if chunks are still in flight
        session.cancel();
        self.metrics.cancel_session();

        let mut partial = String::new();
        self.state.update(|s| {
            partial = std::mem::take(&mut s.streaming_output);
            if !partial.is_empty() {
                s.messages
                    .push(Message::assistant(format!("{}{}", partial, ABORTED_MARKER)));
            }
            s.is_generating = false;
        });

        debug!("Generation aborted with {} chars of partial output", partial.len());
        self.emit(Event::GenerationAborted { partial });
    }

    // ---- recording & transcription ----

    fn start_recording(&mut self) {
        let phase = self.state.snapshot().recording;
        if phase != RecordingPhase::Idle {
            self.report_error(ParleyError::AlreadyActive("recording".into()));
            return;
        }

        let amp_tx = self.amp_tx.clone();
        let on_amplitude = Box::new(move |level: f32| {
            // Best-effort: never block the device read loop
            let _ = amp_tx.try_send(level);
        });

        match self.capture.start(Some(on_amplitude)) {
            Ok(()) => {
                self.state.update(|s| {
                    s.recording = RecordingPhase::Recording;
                    s.last_error = None;
                });
                self.emit(Event::RecordingStarted);
            }
            Err(e) => self.report_error(e),
        }
    }

    fn stop_recording_and_transcribe(&mut self) {
        if self.state.snapshot().recording != RecordingPhase::Recording {
            debug!("Stop requested while not recording; ignoring");
            return;
        }

        let samples = self.capture.stop();
        // The reader thread is joined; discard any levels still buffered so
        // they cannot repopulate a finished recording's meter
        while self.amp_rx.try_recv().is_ok() {}
        self.state.update(|s| s.audio_level = 0.0);
        self.emit(Event::RecordingStopped);

        if !self.asr_available {
            self.state.update(|s| s.recording = RecordingPhase::Idle);
            self.report_error(ParleyError::BackendUnavailable(
                self.speech_backend
                    .load_error()
                    .unwrap_or_else(|| "Speech backend failed to initialize".into()),
            ));
            return;
        }

        let request = TranscribeRequest {
            handle: self.asr_handle.clone(),
            samples: pcm_to_f32(&samples),
            sample_rate: self.config.audio.sample_rate,
        };

        match self.transcriber.submit(request) {
            Ok(()) => {
                self.state.update(|s| s.recording = RecordingPhase::Transcribing);
            }
            Err(e) => {
                self.state.update(|s| s.recording = RecordingPhase::Idle);
                self.report_error(e);
            }
        }
    }

    fn on_transcription(&mut self, outcome: Result<TranscriptionResult>) {
        self.state.update(|s| s.recording = RecordingPhase::Idle);
        match outcome {
            Ok(result) => {
                debug!("Transcription: {:?}", result.text);
                self.state
                    .update(|s| s.last_transcription = Some(result.clone()));
                self.emit(Event::Transcription(result));
            }
            Err(e) => self.report_error(e),
        }
    }

    // ---- model lifecycle ----

    fn load_model(&mut self, path: &Path, kind: ModelKind) {
        if let Err(e) = self.check_load_allowed(kind) {
            self.report_error(e);
            return;
        }

        let name = model_name(path);
        info!("Loading {} model: {}", kind, name);

        // The previous handle is dropped up front so the load never runs
        // against a half-replaced state; failure leaves the slot empty.
        match kind {
            ModelKind::Llm => self.llm.unload(),
            ModelKind::Asr => self.asr_handle = None,
        }
        self.state.update(|s| {
            let phase = ModelPhase::Loading { name: name.clone() };
            match kind {
                ModelKind::Llm => s.llm_model = phase,
                ModelKind::Asr => s.asr_model = phase,
            }
            s.last_error = None;
        });

        let headroom = match kind {
            ModelKind::Llm => self.config.llm_memory_headroom,
            ModelKind::Asr => self.config.asr_memory_headroom,
        };
        let telemetry = Arc::clone(&self.telemetry);
        let load_tx = self.load_tx.clone();
        let path = path.to_path_buf();

        match kind {
            ModelKind::Llm => {
                let backend = self.llm.backend();
                std::thread::spawn(move || {
                    let result = preflight(&path, kind, telemetry.as_ref(), headroom)
                        .and_then(|_| backend.load(&path));
                    let _ = load_tx.send(LoadOutcome::Llm { name, result });
                });
            }
            ModelKind::Asr => {
                let backend = Arc::clone(&self.speech_backend);
                std::thread::spawn(move || {
                    let result = preflight(&path, kind, telemetry.as_ref(), headroom)
                        .and_then(|_| backend.load(&path));
                    let _ = load_tx.send(LoadOutcome::Asr { name, result });
                });
            }
        }
    }

    fn check_load_allowed(&self, kind: ModelKind) -> Result<()> {
        match kind {
            ModelKind::Llm => {
                // A load never runs concurrently with generation on the
                // same handle kind
                if self.generation.is_some() || self.llm.is_generating() {
                    return Err(ParleyError::AlreadyActive("generation".into()));
                }
                if self.state.snapshot().llm_model.is_loading() {
                    return Err(ParleyError::AlreadyActive("model load".into()));
                }
            }
            ModelKind::Asr => {
                if !self.asr_available {
                    return Err(ParleyError::BackendUnavailable(
                        self.speech_backend
                            .load_error()
                            .unwrap_or_else(|| "Speech backend failed to initialize".into()),
                    ));
                }
                let snapshot = self.state.snapshot();
                if snapshot.recording == RecordingPhase::Transcribing {
                    return Err(ParleyError::AlreadyActive("transcription".into()));
                }
                if snapshot.asr_model.is_loading() {
                    return Err(ParleyError::AlreadyActive("model load".into()));
                }
            }
        }
        Ok(())
    }

    fn on_load_outcome(&mut self, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Llm { name, result } => match result {
                Ok(handle) => {
                    self.llm.install(handle, name.clone());
                    self.state
                        .update(|s| s.llm_model = ModelPhase::Loaded { name: name.clone() });
                    info!("LLM model loaded: {}", name);
                    self.emit(Event::ModelLoaded(ModelKind::Llm));
                }
                Err(e) => {
                    self.state.update(|s| s.llm_model = ModelPhase::Unloaded);
                    self.report_error(e);
                }
            },
            LoadOutcome::Asr { name, result } => match result {
                Ok(handle) => {
                    self.asr_handle = Some(handle);
                    self.state
                        .update(|s| s.asr_model = ModelPhase::Loaded { name: name.clone() });
                    info!("ASR model loaded: {}", name);
                    self.emit(Event::ModelLoaded(ModelKind::Asr));
                }
                Err(e) => {
                    self.state.update(|s| s.asr_model = ModelPhase::Unloaded);
                    self.report_error(e);
                }
            },
        }
    }

    fn unload_model(&mut self, kind: ModelKind) {
        match kind {
            ModelKind::Llm => {
                if self.generation.is_some() || self.llm.is_generating() {
                    self.report_error(ParleyError::AlreadyActive("generation".into()));
                    return;
                }
                self.llm.unload();
                self.state.update(|s| s.llm_model = ModelPhase::Unloaded);
            }
            ModelKind::Asr => {
                if self.state.snapshot().recording == RecordingPhase::Transcribing {
                    self.report_error(ParleyError::AlreadyActive("transcription".into()));
                    return;
                }
                self.asr_handle = None;
                self.state.update(|s| s.asr_model = ModelPhase::Unloaded);
            }
        }
        info!("{} model unloaded", kind);
        self.emit(Event::ModelUnloaded(kind));
    }

    // ---- housekeeping ----

    fn clear_conversation(&mut self) {
        self.metrics.reset();
        let stats = self.metrics.get_stats();
        self.state.update(|s| {
            s.messages.clear();
            s.streaming_output.clear();
            s.last_transcription = None;
            s.last_error = None;
            s.inference = stats;
        });
        debug!("Conversation cleared");
    }

    fn report_error(&mut self, error: ParleyError) {
        if error.is_failure() {
            warn!("{}", error);
        }
        self.state.update(|s| s.last_error = Some(error.clone()));
        self.emit(Event::Error(error));
    }

    fn emit(&self, event: Event) {
        // Events are best-effort; a full channel drops rather than blocks
        // the state loop
        if self.event_tx.try_send(event).is_err() {
            trace!("Event channel full; dropping event");
        }
    }

    fn shutdown(&mut self) {
        info!("Orchestrator shutting down");

        if let Some(session) = self.generation.take() {
            session.cancel();
        }
        self.capture.release();
        if let Some(mut sampler) = self.sampler.take() {
            sampler.stop();
        }
        self.llm.unload();
        self.asr_handle = None;

        self.emit(Event::Shutdown);
        info!("Orchestrator stopped");
    }
}

fn model_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Model files must carry a known extension for their kind, exist, and fit
/// in available memory with headroom to spare; a failed load leaves the
/// handle fully absent.
fn preflight(path: &Path, kind: ModelKind, telemetry: &dyn HostTelemetry, headroom: f64) -> Result<()> {
    let accepted: &[&str] = match kind {
        ModelKind::Llm => &["task", "litertlm"],
        ModelKind::Asr => &["bin"],
    };
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !accepted.contains(&extension) {
        return Err(ParleyError::InvalidInput(format!(
            "Unsupported {} model format {:?}; expected one of {:?}",
            kind,
            extension,
            accepted
        )));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|_| ParleyError::InvalidInput(format!("Model file not found: {}", path.display())))?;
    if !metadata.is_file() {
        return Err(ParleyError::InvalidInput(format!(
            "Not a model file: {}",
            path.display()
        )));
    }

    let available = telemetry.memory().available;
    if available > 0 && metadata.len() as f64 > available as f64 * headroom {
        return Err(ParleyError::OutOfMemory(format!(
            "Model is {} MB but only {} MB of memory is available",
            metadata.len() / 1024 / 1024,
            available / 1024 / 1024
        )));
    }

    Ok(())
}
