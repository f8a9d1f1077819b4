//! An output host driven by hand.
//!
//! No hardware is involved: the caller decides when a callback happens by
//! calling [`ManualHost::pump`], which runs the open stream's render
//! function and returns what it wrote. The CLI uses it for dry runs and the
//! tests use it to exercise the engine deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use super::host::{DeviceDescriptor, DeviceId, OutputHost, OutputStream, RenderFn, StreamFormat};
use crate::error::AudioError;

struct OpenStream {
    token: u64,
    format: StreamFormat,
    render: RenderFn,
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<DeviceId, OpenStream>>,
    failing: Mutex<HashSet<DeviceId>>,
    next_token: AtomicU64,
    opened: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the stream entry when the owning [`OutputStream`] is dropped.
struct StreamGuard {
    shared: Arc<Shared>,
    device: DeviceId,
    token: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut streams = lock(&self.shared.streams);
        if streams.get(&self.device).map(|s| s.token) == Some(self.token) {
            streams.remove(&self.device);
            debug!("manual device {} closed", self.device);
        }
    }
}

pub struct ManualHost {
    devices: Vec<DeviceDescriptor>,
    shared: Arc<Shared>,
}

impl ManualHost {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        ManualHost {
            devices,
            shared: Arc::new(Shared::default()),
        }
    }

    /// `count` stereo devices at 48 kHz; the first one is the default.
    pub fn with_devices(count: usize) -> Self {
        let devices = (0..count)
            .map(|id| DeviceDescriptor {
                id,
                name: format!("Manual Output {}", id),
                channels: 2,
                sample_rates: vec![48_000],
                is_default: id == 0,
            })
            .collect();
        Self::new(devices)
    }

    /// Makes every later open of `device` fail until [`ManualHost::heal_device`].
    pub fn fail_device(&self, device: DeviceId) {
        lock(&self.shared.failing).insert(device);
    }

    pub fn heal_device(&self, device: DeviceId) {
        lock(&self.shared.failing).remove(&device);
    }

    /// Runs one callback of `frames` frames on `device`. Returns `None` when
    /// no stream is open there.
    pub fn pump(&self, device: DeviceId, frames: usize) -> Option<Vec<f32>> {
        let mut streams = lock(&self.shared.streams);
        let stream = streams.get_mut(&device)?;
        let channels = usize::from(stream.format.channels.max(1));
        let mut buffer = vec![0.0; frames * channels];
        (stream.render)(&mut buffer, channels);
        Some(buffer)
    }

    pub fn is_open(&self, device: DeviceId) -> bool {
        lock(&self.shared.streams).contains_key(&device)
    }

    /// Streams opened so far, including ones since closed.
    pub fn open_count(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }
}

impl OutputHost for ManualHost {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self.devices.clone())
    }

    fn default_device(&self) -> Option<DeviceId> {
        self.devices.iter().find(|d| d.is_default).map(|d| d.id)
    }

    fn open(&self, device: DeviceId, preferred_rate: u32, render: RenderFn) -> Result<OutputStream, AudioError> {
        let descriptor = self
            .devices
            .iter()
            .find(|d| d.id == device)
            .ok_or(AudioError::DeviceNotFound(device))?;
        if lock(&self.shared.failing).contains(&device) {
            return Err(AudioError::OpenFailed {
                device,
                reason: "device refused to open".to_string(),
            });
        }

        let sample_rate = if descriptor.sample_rates.contains(&preferred_rate) {
            preferred_rate
        } else {
            descriptor.sample_rates.first().copied().unwrap_or(preferred_rate)
        };
        let format = StreamFormat {
            sample_rate,
            channels: descriptor.channels.max(1),
            buffer_frames: None,
        };

        let mut streams = lock(&self.shared.streams);
        if streams.contains_key(&device) {
            return Err(AudioError::OpenFailed {
                device,
                reason: "device already has an open stream".to_string(),
            });
        }
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        streams.insert(device, OpenStream { token, format, render });
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!("manual device {} opened", device);

        let guard = StreamGuard {
            shared: Arc::clone(&self.shared),
            device,
            token,
        };
        Ok(OutputStream::new(format, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_runs_the_render_function() {
        let host = ManualHost::with_devices(1);
        let stream = host
            .open(0, 48_000, Box::new(|data: &mut [f32], _: usize| data.fill(0.25)))
            .expect("open");
        assert_eq!(stream.format().channels, 2);
        assert_eq!(host.pump(0, 4), Some(vec![0.25; 8]));
        drop(stream);
        assert!(!host.is_open(0));
        assert_eq!(host.pump(0, 4), None);
    }

    #[test]
    fn second_open_of_a_device_is_refused() {
        let host = ManualHost::with_devices(1);
        let _first = host.open(0, 48_000, Box::new(|_: &mut [f32], _: usize| {})).expect("open");
        assert!(host.open(0, 48_000, Box::new(|_: &mut [f32], _: usize| {})).is_err());
        assert_eq!(host.open_count(), 1);
    }

    #[test]
    fn failing_and_unknown_devices() {
        let host = ManualHost::with_devices(2);
        host.fail_device(1);
        assert!(matches!(
            host.open(1, 48_000, Box::new(|_: &mut [f32], _: usize| {})),
            Err(AudioError::OpenFailed { device: 1, .. })
        ));
        assert!(matches!(
            host.open(7, 48_000, Box::new(|_: &mut [f32], _: usize| {})),
            Err(AudioError::DeviceNotFound(7))
        ));
        host.heal_device(1);
        assert!(host.open(1, 48_000, Box::new(|_: &mut [f32], _: usize| {})).is_ok());
    }
}
