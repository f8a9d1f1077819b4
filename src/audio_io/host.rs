use std::any::Any;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};
use serde::Serialize;

use crate::error::AudioError;

/// Position of an output device in the host's enumeration order.
pub type DeviceId = usize;

const STANDARD_RATES: [u32; 10] = [
    8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 192_000,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub channels: u16,
    pub sample_rates: Vec<u32>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: Option<u32>,
}

/// Fills one hardware buffer of interleaved samples; the second argument is
/// the channel count of that buffer.
pub type RenderFn = Box<dyn FnMut(&mut [f32], usize) + Send + 'static>;

/// An open, playing stream. Dropping it stops playback and releases the
/// device. Backend stream handles are not always `Send`, so the value stays
/// on the thread that opened it.
pub struct OutputStream {
    format: StreamFormat,
    _stream: Box<dyn Any>,
}

impl OutputStream {
    pub fn new(format: StreamFormat, stream: impl Any) -> Self {
        OutputStream {
            format,
            _stream: Box::new(stream),
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }
}

/// Host audio subsystem seen by the output engine.
pub trait OutputHost: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError>;

    fn default_device(&self) -> Option<DeviceId>;

    /// Opens `device` and starts calling `render` from the host's real-time
    /// thread.
    fn open(&self, device: DeviceId, preferred_rate: u32, render: RenderFn) -> Result<OutputStream, AudioError>;
}

/// The platform's default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    fn device(&self, id: DeviceId) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let device = host.output_devices()?.nth(id);
        device.ok_or(AudioError::DeviceNotFound(id))
    }
}

fn describe(id: DeviceId, device: &cpal::Device, default_name: Option<&str>) -> DeviceDescriptor {
    let name = device.name().unwrap_or_else(|_| format!("output {}", id));
    let ranges = device
        .supported_output_configs()
        .map(|configs| configs.collect::<Vec<_>>())
        .unwrap_or_default();
    let channels = ranges.iter().map(|r| r.channels()).max().unwrap_or(0);
    let sample_rates = STANDARD_RATES
        .iter()
        .copied()
        .filter(|rate| {
            ranges
                .iter()
                .any(|r| r.min_sample_rate().0 <= *rate && r.max_sample_rate().0 >= *rate)
        })
        .collect();
    let is_default = default_name == Some(name.as_str());

    DeviceDescriptor {
        id,
        name,
        channels,
        sample_rates,
        is_default,
    }
}

fn pick_config(
    device: &cpal::Device,
    id: DeviceId,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let configs = device.supported_output_configs()?.collect::<Vec<_>>();

    for cfg in &configs {
        if cfg.sample_format() != cpal::SampleFormat::F32 {
            continue;
        }
        let min = cfg.min_sample_rate().0;
        let max = cfg.max_sample_rate().0;
        if min <= preferred_rate && max >= preferred_rate {
            return Ok(cfg.clone().with_sample_rate(cpal::SampleRate(preferred_rate)));
        }
    }

    let default = device.default_output_config()?;
    if default.sample_format() == cpal::SampleFormat::F32 {
        return Ok(default);
    }

    configs
        .into_iter()
        .find(|cfg| cfg.sample_format() == cpal::SampleFormat::F32)
        .map(|cfg| cfg.with_max_sample_rate())
        .ok_or(AudioError::UnsupportedConfig { device: id })
}

impl OutputHost for CpalHost {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let devices = host
            .output_devices()?
            .enumerate()
            .map(|(id, device)| describe(id, &device, default_name.as_deref()))
            .collect();
        Ok(devices)
    }

    fn default_device(&self) -> Option<DeviceId> {
        let host = cpal::default_host();
        let default_name = host.default_output_device()?.name().ok()?;
        let mut devices = host.output_devices().ok()?;
        devices.position(|d| d.name().map(|n| n == default_name).unwrap_or(false))
    }

    fn open(&self, id: DeviceId, preferred_rate: u32, mut render: RenderFn) -> Result<OutputStream, AudioError> {
        let device = self.device(id)?;
        let supported = pick_config(&device, id, preferred_rate)?;
        let config: cpal::StreamConfig = supported.into();
        let channels = usize::from(config.channels);
        let format = StreamFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            buffer_frames: match config.buffer_size {
                cpal::BufferSize::Fixed(frames) => Some(frames),
                cpal::BufferSize::Default => None,
            },
        };

        let err_fn = move |err: cpal::StreamError| error!("output stream error on device {}: {}", id, err);
        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data, channels),
            err_fn,
            None,
        )?;
        stream.play()?;

        info!(
            "opened output device {} ({}) at {} Hz, {} channels",
            id,
            device.name().unwrap_or_default(),
            format.sample_rate,
            format.channels
        );
        Ok(OutputStream::new(format, stream))
    }
}

/// Looks a device up by its exact name.
pub fn find_device_by_name(host: &dyn OutputHost, name: &str) -> Result<Option<DeviceId>, AudioError> {
    Ok(host.devices()?.into_iter().find(|d| d.name == name).map(|d| d.id))
}
