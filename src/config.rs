//! Configuration for the orchestration core
//!
//! Provides centralized configuration for all components.

/// Configuration for microphone capture
#[derive(Clone, Debug)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Samples pulled from the device per read
    pub chunk_samples: usize,

    /// Hard cap on a single recording, in seconds
    pub max_recording_secs: u32,
}

impl AudioConfig {
    /// Maximum number of buffered samples before capture force-stops itself
    pub fn max_samples(&self) -> usize {
        self.sample_rate as usize * self.max_recording_secs as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_samples: 1024,
            max_recording_secs: 60,
        }
    }
}

/// Configuration for transcription
#[derive(Clone, Debug)]
pub struct TranscribeConfig {
    /// Sample rate the speech backend expects
    pub expected_sample_rate: u32,

    /// Reject mismatched input instead of logging and proceeding
    pub strict_sample_rate: bool,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            expected_sample_rate: 16_000,
            strict_sample_rate: false,
        }
    }
}

/// Configuration for the complete orchestrator
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Audio capture configuration
    pub audio: AudioConfig,

    /// Transcription configuration
    pub transcribe: TranscribeConfig,

    /// Interval between system telemetry samples, in milliseconds
    pub sampler_interval_ms: u64,

    /// Whether to run the periodic system sampler
    pub enable_sampler: bool,

    /// Fraction of available memory a model file may occupy before a load
    /// is rejected as out-of-memory
    pub llm_memory_headroom: f64,
    pub asr_memory_headroom: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            transcribe: TranscribeConfig::default(),
            sampler_interval_ms: 1000,
            enable_sampler: true,
            llm_memory_headroom: 0.7,
            asr_memory_headroom: 0.5,
        }
    }
}

impl OrchestratorConfig {
    /// Set the audio configuration
    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    /// Reject transcription input whose sample rate differs from the backend's
    pub fn with_strict_sample_rate(mut self) -> Self {
        self.transcribe.strict_sample_rate = true;
        self
    }

    /// Disable periodic system telemetry
    pub fn without_sampler(mut self) -> Self {
        self.enable_sampler = false;
        self
    }

    /// Set the sampler tick interval
    pub fn with_sampler_interval_ms(mut self, interval: u64) -> Self {
        self.sampler_interval_ms = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(crate::ParleyError::InvalidInput(
                "sample rate must be non-zero".into(),
            ));
        }
        if self.audio.chunk_samples == 0 {
            return Err(crate::ParleyError::InvalidInput(
                "chunk size must be non-zero".into(),
            ));
        }
        if self.audio.max_recording_secs == 0 {
            return Err(crate::ParleyError::InvalidInput(
                "max recording length must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.llm_memory_headroom)
            || !(0.0..=1.0).contains(&self.asr_memory_headroom)
        {
            return Err(crate::ParleyError::InvalidInput(
                "memory headroom must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
