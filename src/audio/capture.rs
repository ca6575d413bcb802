//! Microphone capture with a bounded PCM buffer and live amplitude metering
//!
//! A dedicated read loop pulls fixed-size chunks from the device, appends them
//! to a shared buffer under a lock, and reports per-chunk RMS amplitude to an
//! optional callback outside the lock. The buffer is hard-capped; hitting the
//! cap force-stops the recording.

use crate::audio::device::AudioDevice;
use crate::audio::rms_amplitude;
use crate::config::AudioConfig;
use crate::{ParleyError, Result};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Best-effort amplitude listener; must not block the read loop.
pub type AmplitudeCallback = Box<dyn Fn(f32) + Send + 'static>;

/// Owns the microphone resource for the duration of a recording.
pub struct AudioCapture {
    device: Arc<dyn AudioDevice>,
    config: AudioConfig,
    buffer: Arc<Mutex<Vec<i16>>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub fn new(device: Arc<dyn AudioDevice>, config: AudioConfig) -> Self {
        Self {
            device,
            config,
            buffer: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Start capturing. Fails fast if a recording is already active, the
    /// microphone permission is missing, or the device cannot be opened.
    pub fn start(&mut self, on_amplitude: Option<AmplitudeCallback>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ParleyError::AlreadyActive("recording".into()));
        }

        if !self.device.has_permission() {
            return Err(ParleyError::PermissionDenied);
        }

        self.buffer.lock().clear();
        self.running.store(true, Ordering::SeqCst);

        let device = Arc::clone(&self.device);
        let buffer = Arc::clone(&self.buffer);
        let running = Arc::clone(&self.running);
        let sample_rate = self.config.sample_rate;
        let chunk_samples = self.config.chunk_samples;
        let max_samples = self.config.max_samples();

        // The stream is opened on the read thread itself (cpal streams are
        // not Send); the open result is reported back before start() returns.
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let handle = std::thread::spawn(move || {
            let mut stream = match device.open_stream(sample_rate) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut chunk = vec![0i16; chunk_samples];

            while running.load(Ordering::SeqCst) {
                match stream.read(&mut chunk) {
                    Ok(0) => continue,
                    Ok(n) => {
                        let (total, appended) = {
                            let mut buf = buffer.lock();
                            let space = max_samples.saturating_sub(buf.len());
                            let take = n.min(space);
                            buf.extend_from_slice(&chunk[..take]);
                            (buf.len(), take)
                        };

                        // Amplitude delivery happens outside the buffer lock
                        if appended > 0 {
                            if let Some(callback) = &on_amplitude {
                                callback(rms_amplitude(&chunk[..n]));
                            }
                        }

                        if total >= max_samples {
                            warn!("Recording exceeded maximum length, stopping");
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        error!("Audio read error: {}", e);
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }

            // Dropping the stream releases the device
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.reader = Some(handle);
                debug!("Recording started at {}Hz mono", sample_rate);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(ParleyError::DeviceError(
                    "Capture thread exited before opening the device".into(),
                ))
            }
        }
    }

    /// Stop capturing and take ownership of the accumulated buffer.
    ///
    /// Joins the read loop and releases the device before returning. Calling
    /// this while not recording returns an empty buffer.
    pub fn stop(&mut self) -> Vec<i16> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                error!("Capture read thread panicked");
            }
        }

        let samples = std::mem::take(&mut *self.buffer.lock());

        let duration_secs = samples.len() as f32 / self.config.sample_rate as f32;
        debug!(
            "Recording stopped: {} samples ({:.1}s)",
            samples.len(),
            duration_secs
        );

        samples
    }

    /// Whether a recording is active. Becomes false as soon as the read loop
    /// force-stops at the sample cap, even before `stop()` is called.
    pub fn is_recording(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of samples buffered so far
    pub fn buffered_samples(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Length of the current recording in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.buffered_samples() as u64 * 1000) / self.config.sample_rate as u64
    }

    /// Forceful teardown for shutdown; stops any active recording first.
    pub fn release(&mut self) {
        let _ = self.stop();
        debug!("AudioCapture released");
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.release();
    }
}
