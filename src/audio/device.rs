//! Audio device provider abstraction
//!
//! Capture talks to a pull-based stream so the read loop owns its own pacing;
//! the cpal adapter bridges cpal's push callbacks into that model.

use crate::Result;

/// Provider of microphone streams.
pub trait AudioDevice: Send + Sync {
    /// Whether microphone access has been granted
    fn has_permission(&self) -> bool;

    /// Open a mono PCM input stream at the given sample rate.
    ///
    /// Called from the capture read-loop thread; the returned stream never
    /// leaves that thread, so it does not need to be `Send`.
    fn open_stream(&self, sample_rate: u32) -> Result<Box<dyn AudioStream>>;
}

/// An open input stream. Dropping it releases the device.
pub trait AudioStream {
    /// Fill `buf` with captured samples, returning how many were written.
    ///
    /// May return `Ok(0)` when no data is available yet; callers should
    /// re-check their stop flag and retry. An `Err` is a device failure.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;
}

#[cfg(feature = "audio-io")]
pub use cpal_device::CpalMicrophone;

#[cfg(feature = "audio-io")]
mod cpal_device {
    use super::{AudioDevice, AudioStream};
    use crate::{ParleyError, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, StreamConfig};
    use crossbeam_channel::{bounded, Receiver};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tracing::{debug, error, info};

    /// Default-host microphone backed by cpal.
    pub struct CpalMicrophone;

    impl CpalMicrophone {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for CpalMicrophone {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioDevice for CpalMicrophone {
        fn has_permission(&self) -> bool {
            // Desktop hosts surface mic permission through the OS prompt at
            // stream-open time; treat access as granted until open fails.
            true
        }

        fn open_stream(&self, sample_rate: u32) -> Result<Box<dyn AudioStream>> {
            let host = cpal::default_host();

            let device = host.default_input_device().ok_or_else(|| {
                ParleyError::DeviceError("No input device available".into())
            })?;

            info!(
                "Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let supported = device.default_input_config().map_err(|e| {
                ParleyError::DeviceError(format!("Failed to get input config: {}", e))
            })?;
            let channels = supported.channels() as usize;

            let config = StreamConfig {
                channels: supported.channels(),
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let (tx, rx) = bounded::<Vec<i16>>(64);

            let err_fn = |err| {
                error!("Audio input stream error: {}", err);
            };

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Average all channels to create mono i16
                        let samples: Vec<i16> = data
                            .chunks(channels)
                            .map(|frame| {
                                let mono = frame.iter().sum::<f32>() / channels as f32;
                                (mono.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                            })
                            .collect();

                        if let Err(e) = tx.try_send(samples) {
                            debug!("Failed to send audio data: {}", e);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| {
                    ParleyError::DeviceError(format!("Failed to build input stream: {}", e))
                })?;

            stream.play().map_err(|e| {
                ParleyError::DeviceError(format!("Failed to start input stream: {}", e))
            })?;

            Ok(Box::new(CpalStream {
                _stream: stream,
                rx,
                pending: VecDeque::new(),
            }))
        }
    }

    struct CpalStream {
        _stream: cpal::Stream,
        rx: Receiver<Vec<i16>>,
        pending: VecDeque<i16>,
    }

    impl AudioStream for CpalStream {
        fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
            // Bounded wait so the capture loop can observe its stop flag
            while self.pending.len() < buf.len() {
                match self.rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(samples) => self.pending.extend(samples),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        return Err(ParleyError::DeviceError(
                            "Input stream closed unexpectedly".into(),
                        ))
                    }
                }
            }

            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                // Length checked above
                *slot = self.pending.pop_front().unwrap_or(0);
            }
            Ok(n)
        }
    }
}
