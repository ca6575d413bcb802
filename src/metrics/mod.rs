pub mod inference;
pub mod system;

pub use inference::{InferenceMetrics, InferenceSession, InferenceStats};
pub use system::{
    CpuCounters, HostTelemetry, MemoryReadings, ProcTelemetry, SamplerWorker, SystemSampler,
    SystemSnapshot, ThermalState,
};
