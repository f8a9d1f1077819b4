mod cli;

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::Rng;
use rustfft::num_complex::Complex32;

use cli::{Cli, Command};
use sdr_pipeline::audio::{self, AudioSource};
use sdr_pipeline::audio_io::{
    find_device_by_name, AudioOutputEngine, CpalHost, DeviceId, DeviceRegistry, ManualHost, OutputHost,
};
use sdr_pipeline::block::IqBlock;
use sdr_pipeline::config::{self, AudioSettings, SpectrumSettings};
use sdr_pipeline::demod::{clamp_bandwidth, DemodCommand, DemodulatorControl, DemodulatorType, MIN_BANDWIDTH};
use sdr_pipeline::queue::SynchronizedQueue;
use sdr_pipeline::spectrum::{SpectralPipeline, SpectrumFeed};

const CLOCK_FRAMES: usize = 480;
const CLOCK_PERIOD: Duration = Duration::from_millis(10);
const TONE_AMPLITUDE: f32 = 0.5;

/// Where engines send their audio: the sound card, or a virtual device
/// clocked by a background thread.
struct Output {
    registry: Arc<DeviceRegistry>,
    clock: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl Output {
    fn new(dry_run: bool, preferred_rate: u32) -> Result<Self> {
        if !dry_run {
            return Ok(Output {
                registry: DeviceRegistry::new(Arc::new(CpalHost), preferred_rate),
                clock: None,
            });
        }

        let manual = Arc::new(ManualHost::with_devices(2));
        let registry = DeviceRegistry::new(Arc::clone(&manual) as Arc<dyn OutputHost>, preferred_rate);
        let running = Arc::new(AtomicBool::new(true));

        let clock_registry = Arc::clone(&registry);
        let clock_running = Arc::clone(&running);
        let clock = thread::Builder::new()
            .name("virtual-clock".to_string())
            .spawn(move || {
                while clock_running.load(Ordering::Relaxed) {
                    for device in clock_registry.active_devices() {
                        manual.pump(device, CLOCK_FRAMES);
                    }
                    thread::sleep(CLOCK_PERIOD);
                }
            })
            .context("failed to start the virtual clock")?;

        log::info!("dry run: playing into virtual devices");
        Ok(Output {
            registry,
            clock: Some((running, clock)),
        })
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if let Some((running, clock)) = self.clock.take() {
            running.store(false, Ordering::Relaxed);
            let _ = clock.join();
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::settings_path);
    let settings = config::load_settings(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;
    if config_path.exists() {
        log::info!("Loaded settings from {}", config_path.display());
    }

    match cli.command {
        Command::Devices { json } => {
            let output = Output::new(cli.dry_run, settings.audio.preferred_sample_rate)?;
            list_devices(&**output.registry.host(), json)
        }
        Command::Play {
            input,
            device,
            gain,
            block_frames,
        } => {
            let source = audio::load_wav(&input)?;
            log::info!(
                "{}: {} Hz, {} channels, {:.1} s",
                input.display(),
                source.sample_rate,
                source.channels,
                source.duration_secs()
            );
            let output = Output::new(cli.dry_run, source.sample_rate)?;
            let device = resolve_device(&**output.registry.host(), device.as_deref())?;
            play(&output, settings.audio, &source, device, gain, block_frames)
        }
        Command::Tone { freq, seconds, device } => {
            let rate = settings.audio.preferred_sample_rate;
            let source = audio::sine(freq, rate, seconds, TONE_AMPLITUDE);
            let output = Output::new(cli.dry_run, rate)?;
            let device = resolve_device(&**output.registry.host(), device.as_deref())?;
            play(&output, settings.audio, &source, device, None, 2048)
        }
        Command::Spectrum {
            fft_size,
            rate,
            tone,
            noise,
            frames,
            center,
            view_center,
            view_bandwidth,
        } => {
            let mut spectrum_settings = settings.spectrum;
            if let Some(size) = fft_size {
                spectrum_settings.fft_size = size;
            }
            let view = view_center.zip(view_bandwidth);
            run_spectrum(spectrum_settings, rate, center, tone, noise, frames, view)
        }
    }
}

fn list_devices(host: &dyn OutputHost, json: bool) -> Result<()> {
    let devices = AudioOutputEngine::enumerate_devices(host)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }
    for device in devices {
        let rates: Vec<String> = device.sample_rates.iter().map(|r| r.to_string()).collect();
        println!(
            "{:>3}{} {}  ({} ch; {})",
            device.id,
            if device.is_default { "*" } else { " " },
            device.name,
            device.channels,
            rates.join(", ")
        );
    }
    Ok(())
}

/// Accepts a numeric id or an exact device name.
fn resolve_device(host: &dyn OutputHost, arg: Option<&str>) -> Result<Option<DeviceId>> {
    let Some(arg) = arg else {
        return Ok(None);
    };
    if let Ok(id) = arg.parse::<DeviceId>() {
        return Ok(Some(id));
    }
    find_device_by_name(host, arg)?
        .map(Some)
        .ok_or_else(|| anyhow!("no output device named {:?}", arg))
}

fn play(
    output: &Output,
    settings: AudioSettings,
    source: &AudioSource,
    device: Option<DeviceId>,
    gain: Option<f32>,
    block_frames: usize,
) -> Result<()> {
    let engine = AudioOutputEngine::new(Arc::clone(&output.registry), settings);
    if let Some(gain) = gain {
        engine.set_gain(gain);
    }
    let format = engine.start(device)?;
    if format.sample_rate != source.sample_rate {
        log::warn!(
            "device runs at {} Hz, source is {} Hz; no rate conversion is applied",
            format.sample_rate,
            source.sample_rate
        );
    }

    // stay two blocks ahead of the device
    let block_time = block_frames.max(1) as f32 / source.sample_rate.max(1) as f32;
    let started = Instant::now();
    let mut submitted = 0usize;
    for (n, block) in source.blocks(block_frames).enumerate() {
        let due = Duration::from_secs_f32(block_time * n.saturating_sub(2) as f32);
        if let Some(wait) = due.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
        engine.submit(block);
        submitted += 1;
    }

    let deadline = Instant::now() + Duration::from_secs_f32(block_time * 4.0 + 1.0);
    while engine.snapshot().queued_blocks > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_secs_f32(block_time));

    let snapshot = engine.snapshot();
    engine.stop();
    println!(
        "played {} of {} blocks on device {} ({} underflows)",
        snapshot.blocks_played,
        submitted,
        snapshot.device.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
        snapshot.underflows
    );
    Ok(())
}

fn run_spectrum(
    settings: SpectrumSettings,
    rate: u32,
    center: i64,
    tone: f32,
    noise: f32,
    frames: usize,
    view: Option<(i64, i64)>,
) -> Result<()> {
    let rate = rate.max(1);
    let pipeline = SpectralPipeline::new(settings.sanitized());
    let fft_size = pipeline.fft_size();
    let mut feed = SpectrumFeed::new(Arc::new(SynchronizedQueue::new()), pipeline);

    if let Some((view_center, view_bandwidth)) = view {
        let demod = DemodulatorControl::new(center, MIN_BANDWIDTH, DemodulatorType::Fm);
        demod.send(DemodCommand::SetFrequency(view_center));
        demod.send(DemodCommand::SetBandwidth(clamp_bandwidth(view_bandwidth, rate)));
        demod.apply_pending();
        feed.set_view(demod.frequency(), demod.bandwidth());
        log::info!("viewing {} Hz around {} Hz", demod.bandwidth(), demod.frequency());
    }

    let block_len = (rate as usize / 20).max(fft_size);
    let block_time = Duration::from_secs_f32(block_len as f32 / rate as f32);
    let running = Arc::new(AtomicBool::new(true));

    let input = feed.input();
    let producer_running = Arc::clone(&running);
    let producer = thread::Builder::new()
        .name("iq-source".to_string())
        .spawn(move || {
            let mut rng = rand::thread_rng();
            let noise = noise.abs();
            let step = TAU * tone / rate as f32;
            let mut phase = 0.0f32;
            while producer_running.load(Ordering::Relaxed) {
                let samples = (0..block_len)
                    .map(|_| {
                        let s = Complex32::from_polar(0.9, phase);
                        phase = (phase + step) % TAU;
                        s + Complex32::new(rng.gen_range(-noise..=noise), rng.gen_range(-noise..=noise))
                    })
                    .collect();
                input.push(IqBlock::new(center, rate, samples));
                thread::sleep(block_time);
            }
        })
        .context("failed to start the IQ source")?;

    let mut rendered = 0;
    while rendered < frames {
        let Some(frame) = feed.tick(Duration::from_millis(200)) else {
            continue;
        };
        rendered += 1;
        if rendered % 10 != 0 && rendered != frames {
            continue;
        }
        if let Some((bin, point)) = frame.peak() {
            let hz = frame.center_frequency as f64 + (f64::from(point.x) - 0.5) * f64::from(frame.bandwidth);
            println!(
                "frame {:>5}  {}  peak bin {:>5}  x {:.4}  level {:.3}  ~{:.0} Hz",
                frame.sequence,
                if frame.view { "view" } else { "full" },
                bin,
                point.x,
                point.level,
                hz
            );
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = producer.join();

    let (floor, ceiling) = feed.pipeline().level_bounds();
    println!(
        "{} frames, {} stale blocks skipped, level range {:.3}..{:.3}",
        rendered,
        feed.stale_blocks(),
        floor,
        ceiling
    );
    Ok(())
}
