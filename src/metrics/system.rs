//! Best-effort host resource telemetry
//!
//! Periodic, read-only sampling of memory, CPU, GPU memory and thermal state.
//! Telemetry must never destabilize the main flow: every read failure
//! degrades to a neutral default instead of propagating an error.

use crossbeam_channel::{after, bounded, Receiver, Sender};
use serde::Serialize;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// Host memory readings in bytes; zero where unreadable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryReadings {
    pub total: u64,
    pub available: u64,
    pub app_resident: u64,
}

/// Cumulative CPU time counters, `/proc/stat` style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCounters {
    pub total: u64,
    pub idle: u64,
}

/// Coarse thermal classification derived from the hottest readable zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ThermalState {
    #[default]
    Unknown,
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalState {
    fn from_celsius(celsius: f32) -> Self {
        match celsius {
            c if c < 60.0 => ThermalState::Nominal,
            c if c < 70.0 => ThermalState::Fair,
            c if c < 80.0 => ThermalState::Serious,
            _ => ThermalState::Critical,
        }
    }

    pub fn is_throttling(&self) -> bool {
        matches!(self, ThermalState::Serious | ThermalState::Critical)
    }
}

/// One snapshot of host resource usage
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SystemSnapshot {
    pub memory: MemoryReadings,
    pub gpu_memory_bytes: u64,
    pub cpu_percent: f32,
    pub cpu_cores: usize,
    pub thermal_celsius: f32,
    pub thermal: ThermalState,
}

/// Read-only accessors for host counters. All may fail independently.
pub trait HostTelemetry: Send + Sync {
    fn memory(&self) -> MemoryReadings;
    fn cpu_counters(&self) -> Option<CpuCounters>;
    fn gpu_memory_bytes(&self) -> u64;
    fn thermal_celsius(&self) -> Option<f32>;
    fn cpu_cores(&self) -> usize;
}

/// Computes snapshots from a telemetry source, carrying the previous CPU
/// counters so utilization can be derived as a delta.
pub struct SystemSampler {
    telemetry: std::sync::Arc<dyn HostTelemetry>,
    last_cpu: Option<CpuCounters>,
}

impl SystemSampler {
    pub fn new(telemetry: std::sync::Arc<dyn HostTelemetry>) -> Self {
        Self {
            telemetry,
            last_cpu: None,
        }
    }

    pub fn sample(&mut self) -> SystemSnapshot {
        let memory = self.telemetry.memory();
        let gpu_memory_bytes = self.telemetry.gpu_memory_bytes();
        let cpu_percent = self.cpu_percent();

        let (thermal_celsius, thermal) = match self.telemetry.thermal_celsius() {
            Some(celsius) => (celsius, ThermalState::from_celsius(celsius)),
            None => (0.0, ThermalState::Unknown),
        };

        trace!(
            "System sample: cpu {:.1}%, mem {}/{} bytes, {:.1}C",
            cpu_percent,
            memory.total - memory.available,
            memory.total,
            thermal_celsius
        );

        SystemSnapshot {
            memory,
            gpu_memory_bytes,
            cpu_percent,
            cpu_cores: self.telemetry.cpu_cores(),
            thermal_celsius,
            thermal,
        }
    }

    /// Delta between two successive cumulative counters. The first sample
    /// after a cold start or a counter reset yields 0% rather than a spike.
    fn cpu_percent(&mut self) -> f32 {
        let Some(counters) = self.telemetry.cpu_counters() else {
            return 0.0;
        };

        let Some(last) = self.last_cpu.replace(counters) else {
            return 0.0;
        };

        if counters.total < last.total || counters.idle < last.idle {
            // Counter reset; re-prime on this sample
            return 0.0;
        }

        let total_delta = counters.total - last.total;
        let idle_delta = counters.idle - last.idle;
        if total_delta == 0 {
            return 0.0;
        }

        let usage = (total_delta - idle_delta) as f32 / total_delta as f32 * 100.0;
        usage.clamp(0.0, 100.0)
    }
}

/// Periodic sampler thread with an explicit stop signal.
pub struct SamplerWorker {
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SamplerWorker {
    pub fn spawn(
        mut sampler: SystemSampler,
        interval: Duration,
        out: Sender<SystemSnapshot>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = std::thread::spawn(move || {
            debug!("System sampler started ({}ms interval)", interval.as_millis());
            loop {
                crossbeam_channel::select! {
                    recv(stop_rx) -> _ => break,
                    recv(after(interval)) -> _ => {
                        if out.send(sampler.sample()).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("System sampler stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        }
    }

    /// Stop the tick loop and join the worker.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SamplerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `/proc` and `/sys` backed telemetry for Linux hosts.
pub struct ProcTelemetry;

impl ProcTelemetry {
    pub fn new() -> Self {
        Self
    }

    fn read_meminfo_kb(field: &str) -> Option<u64> {
        let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
        contents
            .lines()
            .find(|line| line.starts_with(field))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    fn read_vmrss_kb() -> Option<u64> {
        let contents = std::fs::read_to_string("/proc/self/status").ok()?;
        contents
            .lines()
            .find(|line| line.starts_with("VmRSS"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    fn read_thermal_zone(path: &str) -> Option<f32> {
        let raw: f32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
        // Zones report millidegrees
        Some(if raw > 1000.0 { raw / 1000.0 } else { raw })
    }
}

impl Default for ProcTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTelemetry for ProcTelemetry {
    fn memory(&self) -> MemoryReadings {
        MemoryReadings {
            total: Self::read_meminfo_kb("MemTotal").unwrap_or(0) * 1024,
            available: Self::read_meminfo_kb("MemAvailable").unwrap_or(0) * 1024,
            app_resident: Self::read_vmrss_kb().unwrap_or(0) * 1024,
        }
    }

    fn cpu_counters(&self) -> Option<CpuCounters> {
        let contents = std::fs::read_to_string("/proc/stat").ok()?;
        let line = contents.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(4)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        // user + nice + system + idle
        Some(CpuCounters {
            total: fields.iter().sum(),
            idle: fields[3],
        })
    }

    fn gpu_memory_bytes(&self) -> u64 {
        // Adreno-style sysfs node; absent on most hosts
        std::fs::read_to_string("/sys/class/kgsl/kgsl-3d0/gpumem_mapped")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn thermal_celsius(&self) -> Option<f32> {
        const ZONES: [&str; 3] = [
            "/sys/class/thermal/thermal_zone0/temp",
            "/sys/class/thermal/thermal_zone1/temp",
            "/sys/devices/virtual/thermal/thermal_zone0/temp",
        ];
        ZONES.iter().find_map(|path| Self::read_thermal_zone(path))
    }

    fn cpu_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Telemetry that replays a scripted sequence of CPU counters.
    struct ScriptedTelemetry {
        counters: Arc<Mutex<Vec<Option<CpuCounters>>>>,
    }

    impl ScriptedTelemetry {
        fn new(script: Vec<Option<CpuCounters>>) -> Self {
            let mut reversed = script;
            reversed.reverse();
            Self {
                counters: Arc::new(Mutex::new(reversed)),
            }
        }
    }

    impl HostTelemetry for ScriptedTelemetry {
        fn memory(&self) -> MemoryReadings {
            MemoryReadings {
                total: 8 << 30,
                available: 4 << 30,
                app_resident: 1 << 30,
            }
        }

        fn cpu_counters(&self) -> Option<CpuCounters> {
            self.counters.lock().pop().flatten()
        }

        fn gpu_memory_bytes(&self) -> u64 {
            0
        }

        fn thermal_celsius(&self) -> Option<f32> {
            Some(45.0)
        }

        fn cpu_cores(&self) -> usize {
            8
        }
    }

    #[test]
    fn test_first_cpu_sample_is_zero() {
        let telemetry = ScriptedTelemetry::new(vec![
            Some(CpuCounters {
                total: 1000,
                idle: 800,
            }),
            Some(CpuCounters {
                total: 2000,
                idle: 1600,
            }),
        ]);
        let mut sampler = SystemSampler::new(Arc::new(telemetry));

        assert_eq!(sampler.sample().cpu_percent, 0.0);
        // +1000 total, +800 idle since last sample -> 20% busy
        let second = sampler.sample();
        assert!((second.cpu_percent - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_counter_reset_yields_zero() {
        let telemetry = ScriptedTelemetry::new(vec![
            Some(CpuCounters {
                total: 5000,
                idle: 4000,
            }),
            // Reboot-style reset: counters went backwards
            Some(CpuCounters {
                total: 100,
                idle: 80,
            }),
            Some(CpuCounters {
                total: 200,
                idle: 130,
            }),
        ]);
        let mut sampler = SystemSampler::new(Arc::new(telemetry));

        sampler.sample();
        assert_eq!(sampler.sample().cpu_percent, 0.0);
        // Delta math resumes from the reset baseline
        assert!((sampler.sample().cpu_percent - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_unreadable_counters_degrade_to_zero() {
        let telemetry = ScriptedTelemetry::new(vec![None, None]);
        let mut sampler = SystemSampler::new(Arc::new(telemetry));

        let snapshot = sampler.sample();
        assert_eq!(snapshot.cpu_percent, 0.0);
        assert_eq!(snapshot.thermal, ThermalState::Nominal);
        assert_eq!(snapshot.memory.total, 8 << 30);
    }

    #[test]
    fn test_thermal_classification() {
        assert_eq!(ThermalState::from_celsius(40.0), ThermalState::Nominal);
        assert_eq!(ThermalState::from_celsius(65.0), ThermalState::Fair);
        assert_eq!(ThermalState::from_celsius(75.0), ThermalState::Serious);
        assert_eq!(ThermalState::from_celsius(95.0), ThermalState::Critical);
        assert!(ThermalState::Critical.is_throttling());
        assert!(!ThermalState::Unknown.is_throttling());
    }

    #[test]
    fn test_worker_ticks_and_stops() {
        let script: Vec<Option<CpuCounters>> = (0..64)
            .map(|i| {
                Some(CpuCounters {
                    total: 1000 * (i + 1),
                    idle: 500 * (i + 1),
                })
            })
            .collect();
        let sampler = SystemSampler::new(Arc::new(ScriptedTelemetry::new(script)));

        let (tx, rx) = bounded(64);
        let mut worker = SamplerWorker::spawn(sampler, Duration::from_millis(10), tx);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.cpu_percent, 0.0);
        assert!(second.cpu_percent > 0.0);

        worker.stop();
        // Channel drains and closes once the worker is gone
        while rx.try_recv().is_ok() {}
        assert!(rx.try_recv().is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_telemetry_reads_host() {
        let telemetry = ProcTelemetry::new();
        let memory = telemetry.memory();
        assert!(memory.total > 0);
        assert!(memory.app_resident > 0);
        assert!(telemetry.cpu_counters().is_some());
        assert!(telemetry.cpu_cores() >= 1);
    }
}
