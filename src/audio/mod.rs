pub mod capture;
pub mod device;

pub use capture::{AmplitudeCallback, AudioCapture};
#[cfg(feature = "audio-io")]
pub use device::CpalMicrophone;
pub use device::{AudioDevice, AudioStream};

/// Convert captured i16 PCM to the normalized f32 range speech backends expect
pub fn pcm_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// RMS of a chunk, normalized against full-scale i16 amplitude, clamped to [0, 1]
pub fn rms_amplitude(chunk: &[i16]) -> f32 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum: f64 = chunk.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / chunk.len() as f64).sqrt();
    ((rms / i16::MAX as f64) as f32).clamp(0.0, 1.0)
}
