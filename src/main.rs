use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley::metrics::{ProcTelemetry, SystemSampler};

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Parley device check");

    report_system()?;

    #[cfg(feature = "audio-io")]
    record_sample()?;

    #[cfg(not(feature = "audio-io"))]
    info!("Built without audio-io; skipping microphone check");

    Ok(())
}

fn report_system() -> Result<()> {
    let mut sampler = SystemSampler::new(Arc::new(ProcTelemetry::new()));

    // First sample primes the CPU counters, second yields a real delta
    sampler.sample();
    std::thread::sleep(Duration::from_millis(500));
    let snapshot = sampler.sample();

    info!(
        "System: {:.0}% CPU on {} cores, {} MB available, thermal {:?} ({:.1}°C)",
        snapshot.cpu_percent,
        snapshot.cpu_cores,
        snapshot.memory.available / 1024 / 1024,
        snapshot.thermal,
        snapshot.thermal_celsius,
    );

    Ok(())
}

#[cfg(feature = "audio-io")]
fn record_sample() -> Result<()> {
    use parley::audio::capture::AudioCapture;
    use parley::audio::device::CpalMicrophone;
    use parley::config::AudioConfig;
    use std::io::Write;

    info!("Recording 3 seconds from the default microphone...");

    let mut capture = AudioCapture::new(Arc::new(CpalMicrophone::new()), AudioConfig::default());
    capture.start(Some(Box::new(|level| {
        print!("\rlevel: {:.3}  ", level);
        let _ = std::io::stdout().flush();
    })))?;

    std::thread::sleep(Duration::from_secs(3));
    let samples = capture.stop();
    println!();

    info!(
        "Captured {} samples ({} ms)",
        samples.len(),
        samples.len() as u64 * 1000 / AudioConfig::default().sample_rate as u64
    );

    Ok(())
}
