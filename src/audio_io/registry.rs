//! Shared output devices.
//!
//! Every engine reaches its hardware through a [`DeviceRegistry`]. The first
//! engine bound to a device starts a controller that owns the one output
//! stream for that device; later engines are attached to the same
//! controller and mixed into its callback. The controller closes the stream
//! when its last engine detaches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use super::host::{DeviceId, OutputHost, StreamFormat};
use super::render::EngineTap;
use crate::error::AudioError;

const CONTROLLER_PARK: Duration = Duration::from_millis(50);

type Taps = Arc<Mutex<Vec<Arc<EngineTap>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DeviceController {
    device: DeviceId,
    format: StreamFormat,
    taps: Taps,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceController {
    fn start(host: Arc<dyn OutputHost>, device: DeviceId, preferred_rate: u32) -> Result<Self, AudioError> {
        let taps: Taps = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let taps_for_output = Arc::clone(&taps);
        let missed = AtomicU32::new(0);
        let shutdown_for_thread = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name(format!("audio-device-{}", device))
            .spawn(move || {
                let render = Box::new(move |data: &mut [f32], channels: usize| {
                    mix(&taps_for_output, &missed, data, channels);
                });
                let stream = match host.open(device, preferred_rate, render) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(stream.format()));
                while !shutdown_for_thread.load(Ordering::Acquire) {
                    thread::park_timeout(CONTROLLER_PARK);
                }
                drop(stream);
                debug!("device {} stream closed", device);
            })?;

        let format = match ready_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::OpenFailed {
                    device,
                    reason: "device thread exited during open".to_string(),
                });
            }
        };

        Ok(DeviceController {
            device,
            format,
            taps,
            shutdown,
            thread: Some(thread),
        })
    }

    fn attach(&self, tap: Arc<EngineTap>) {
        let mut taps = lock(&self.taps);
        if !taps.iter().any(|t| Arc::ptr_eq(t, &tap)) {
            taps.push(tap);
        }
    }

    /// Once this returns the callback holds no reference to `tap`: the
    /// callback mixes under the same lock.
    fn detach(&self, tap: &Arc<EngineTap>) -> bool {
        let mut taps = lock(&self.taps);
        let before = taps.len();
        taps.retain(|t| !Arc::ptr_eq(t, tap));
        taps.len() != before
    }

    fn bound(&self) -> usize {
        lock(&self.taps).len()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("device {} thread panicked", self.device);
            }
        }
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hardware callback body: silence, then every attached engine on top.
///
/// A callback that finds the taps locked by an attach or detach stays
/// silent; it is charged as an underflow to the engines attached when the
/// lock is next taken.
fn mix(taps: &Mutex<Vec<Arc<EngineTap>>>, missed: &AtomicU32, data: &mut [f32], channels: usize) {
    data.fill(0.0);
    let Ok(taps) = taps.try_lock() else {
        missed.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let missed = missed.swap(0, Ordering::Relaxed);
    for tap in taps.iter() {
        if missed > 0 {
            tap.count_underflows(missed);
        }
        tap.render(data, channels);
    }
    if taps.len() > 1 {
        for sample in data.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

/// Process-scoped owner of all device controllers.
///
/// Create one per process (or per test) and hand it to every engine.
/// Dropping it, or calling [`DeviceRegistry::shutdown`], closes all
/// remaining streams.
pub struct DeviceRegistry {
    host: Arc<dyn OutputHost>,
    preferred_rate: u32,
    controllers: Mutex<HashMap<DeviceId, DeviceController>>,
    next_engine: AtomicUsize,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn OutputHost>, preferred_rate: u32) -> Arc<Self> {
        Arc::new(DeviceRegistry {
            host,
            preferred_rate,
            controllers: Mutex::new(HashMap::new()),
            next_engine: AtomicUsize::new(0),
        })
    }

    pub fn host(&self) -> &Arc<dyn OutputHost> {
        &self.host
    }

    pub(crate) fn next_engine_id(&self) -> usize {
        self.next_engine.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn bind(&self, device: DeviceId, tap: Arc<EngineTap>) -> Result<StreamFormat, AudioError> {
        let engine = tap.id;
        let mut controllers = lock(&self.controllers);
        if let Some(controller) = controllers.get(&device) {
            controller.attach(tap);
            debug!("engine {} joined running device {}", engine, device);
            return Ok(controller.format);
        }

        let controller = DeviceController::start(Arc::clone(&self.host), device, self.preferred_rate)?;
        info!(
            "device {} controller started ({} Hz, {} channels)",
            device, controller.format.sample_rate, controller.format.channels
        );
        controller.attach(tap);
        debug!("engine {} owns device {}", engine, device);
        let format = controller.format;
        controllers.insert(device, controller);
        Ok(format)
    }

    pub(crate) fn unbind(&self, device: DeviceId, tap: &Arc<EngineTap>) {
        let mut controllers = lock(&self.controllers);
        let Some(controller) = controllers.get(&device) else {
            return;
        };
        if !controller.detach(tap) {
            return;
        }
        if controller.bound() == 0 {
            if let Some(mut controller) = controllers.remove(&device) {
                controller.stop();
                info!("device {} released", device);
            }
        }
    }

    /// Devices with an open stream.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = lock(&self.controllers).keys().copied().collect();
        devices.sort_unstable();
        devices
    }

    /// Engines currently mixed into `device`.
    pub fn bound_engines(&self, device: DeviceId) -> usize {
        lock(&self.controllers)
            .get(&device)
            .map(|c| c.bound())
            .unwrap_or(0)
    }

    pub fn shutdown(&self) {
        let controllers: Vec<_> = lock(&self.controllers).drain().collect();
        for (device, mut controller) in controllers {
            controller.stop();
            debug!("device {} shut down", device);
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
