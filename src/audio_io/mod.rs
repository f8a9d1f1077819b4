//! PCM playback.
//!
//! An [`AudioOutputEngine`] takes demodulated blocks from its input queue on
//! its own thread and hands them to the hardware callback through a
//! lock-free ring. The callback plays each block through its full length
//! across as many callbacks as it takes, and writes silence (counting an
//! underflow) whenever nothing is ready. Devices are reached through a
//! shared [`DeviceRegistry`], so several engines may play into one device.

mod host;
mod manual;
mod registry;
mod render;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

pub use host::{find_device_by_name, CpalHost, DeviceDescriptor, DeviceId, OutputHost, OutputStream, RenderFn, StreamFormat};
pub use manual::ManualHost;
pub use registry::DeviceRegistry;

use crate::block::PcmBlock;
use crate::command::{AudioCommand, CommandChannel};
use crate::config::AudioSettings;
use crate::error::AudioError;
use crate::queue::SynchronizedQueue;
use render::{block_rings, BlockFeed, EngineTap};

const NO_DEVICE: usize = usize::MAX;
const RING_FULL_BACKOFF: Duration = Duration::from_millis(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of an engine for status displays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSnapshot {
    pub running: bool,
    pub active: bool,
    pub gain: f32,
    pub device: Option<DeviceId>,
    pub format: Option<StreamFormat>,
    pub underflows: u32,
    pub blocks_played: u64,
    /// Blocks waiting in the input queue plus those handed to the callback.
    pub queued_blocks: usize,
}

struct EngineShared {
    terminated: AtomicBool,
    device: AtomicUsize,
    format: Mutex<Option<StreamFormat>>,
    buffered: AtomicUsize,
}

impl EngineShared {
    fn device(&self) -> Option<DeviceId> {
        match self.device.load(Ordering::Acquire) {
            NO_DEVICE => None,
            device => Some(device),
        }
    }

    fn format(&self) -> Option<StreamFormat> {
        *lock(&self.format)
    }

    fn set_bound(&self, bound: Option<(DeviceId, StreamFormat)>) {
        match bound {
            Some((device, format)) => {
                self.device.store(device, Ordering::Release);
                *lock(&self.format) = Some(format);
            }
            None => {
                self.device.store(NO_DEVICE, Ordering::Release);
                *lock(&self.format) = None;
            }
        }
    }
}

pub struct AudioOutputEngine {
    id: usize,
    settings: AudioSettings,
    registry: Arc<DeviceRegistry>,
    input: Arc<SynchronizedQueue<Arc<PcmBlock>>>,
    commands: Arc<CommandChannel<AudioCommand>>,
    tap: Arc<EngineTap>,
    feed: Arc<Mutex<BlockFeed>>,
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioOutputEngine {
    pub fn new(registry: Arc<DeviceRegistry>, settings: AudioSettings) -> Self {
        let settings = settings.sanitized();
        let id = registry.next_engine_id();
        let (feed, renderer) = block_rings(settings.ring_capacity);

        AudioOutputEngine {
            id,
            tap: Arc::new(EngineTap::new(id, renderer, settings.gain)),
            settings,
            registry,
            input: Arc::new(SynchronizedQueue::new()),
            commands: Arc::new(CommandChannel::new()),
            feed: Arc::new(Mutex::new(feed)),
            shared: Arc::new(EngineShared {
                terminated: AtomicBool::new(true),
                device: AtomicUsize::new(NO_DEVICE),
                format: Mutex::new(None),
                buffered: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Devices offered by `host`. Does not touch any engine state.
    pub fn enumerate_devices(host: &dyn OutputHost) -> Result<Vec<DeviceDescriptor>, AudioError> {
        host.devices()
    }

    /// Binds to `device` (or the configured one, or the host default) and
    /// starts the engine thread. On failure the engine stays stopped and may
    /// be started again with another device.
    pub fn start(&self, device: Option<DeviceId>) -> Result<StreamFormat, AudioError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let device = device
            .or(self.settings.output_device)
            .or_else(|| self.registry.host().default_device())
            .ok_or(AudioError::NoDefaultDevice)?;

        let format = self.registry.bind(device, Arc::clone(&self.tap))?;
        self.shared.set_bound(Some((device, format)));
        self.shared.terminated.store(false, Ordering::Release);

        let context = Worker {
            id: self.id,
            poll: Duration::from_millis(self.settings.poll_interval_ms),
            registry: Arc::clone(&self.registry),
            input: Arc::clone(&self.input),
            commands: Arc::clone(&self.commands),
            tap: Arc::clone(&self.tap),
            feed: Arc::clone(&self.feed),
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name(format!("audio-engine-{}", self.id))
            .spawn(move || context.run());
        match handle {
            Ok(handle) => *worker = Some(handle),
            Err(err) => {
                self.shared.terminated.store(true, Ordering::Release);
                self.registry.unbind(device, &self.tap);
                self.shared.set_bound(None);
                return Err(err.into());
            }
        }

        info!(
            "audio engine {} started on device {} ({} Hz, {} channels)",
            self.id, device, format.sample_rate, format.channels
        );
        Ok(format)
    }

    /// Stops the engine thread and releases the device. Safe to call from
    /// any thread and any number of times.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        self.shared.terminated.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("audio engine {} thread panicked", self.id);
        }

        if let Some(device) = self.shared.device() {
            self.registry.unbind(device, &self.tap);
        }
        self.shared.set_bound(None);

        let dropped = self.tap.clear() + self.input.flush();
        lock(&self.feed).release_retired();
        self.shared.buffered.store(0, Ordering::Relaxed);
        let stale_commands = self.commands.drain().count();
        info!(
            "audio engine {} stopped ({} blocks dropped, {} commands discarded)",
            self.id, dropped, stale_commands
        );
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Gates playback without closing the device. While inactive, submitted
    /// blocks are discarded and the engine contributes silence.
    pub fn set_active(&self, active: bool) {
        self.tap.set_active(active);
        debug!("audio engine {} active: {}", self.id, active);
    }

    pub fn is_active(&self) -> bool {
        self.tap.is_active()
    }

    /// Queues a block for playback. Never blocks; empty blocks are ignored.
    pub fn submit(&self, block: impl Into<Arc<PcmBlock>>) {
        let block = block.into();
        if block.is_empty() {
            return;
        }
        self.input.push(block);
    }

    pub fn send_command(&self, command: AudioCommand) {
        self.commands.push(command);
    }

    pub fn set_gain(&self, gain: f32) {
        if gain.is_finite() && gain >= 0.0 {
            self.tap.set_gain(gain);
        }
    }

    pub fn gain(&self) -> f32 {
        self.tap.gain()
    }

    pub fn underflow_count(&self) -> u32 {
        self.tap.underflows()
    }

    pub fn output_device(&self) -> Option<DeviceId> {
        self.shared.device()
    }

    pub fn stream_format(&self) -> Option<StreamFormat> {
        self.shared.format()
    }

    pub fn input_queue(&self) -> Arc<SynchronizedQueue<Arc<PcmBlock>>> {
        Arc::clone(&self.input)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            running: self.is_running(),
            active: self.tap.is_active(),
            gain: self.tap.gain(),
            device: self.shared.device(),
            format: self.stream_format(),
            underflows: self.tap.underflows(),
            blocks_played: self.tap.blocks_started(),
            queued_blocks: self.input.len() + self.shared.buffered.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioOutputEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the engine thread.
struct Worker {
    id: usize,
    poll: Duration,
    registry: Arc<DeviceRegistry>,
    input: Arc<SynchronizedQueue<Arc<PcmBlock>>>,
    commands: Arc<CommandChannel<AudioCommand>>,
    tap: Arc<EngineTap>,
    feed: Arc<Mutex<BlockFeed>>,
    shared: Arc<EngineShared>,
}

impl Worker {
    fn run(self) {
        let mut feed = lock(&self.feed);
        let mut pending: Option<Arc<PcmBlock>> = None;
        let mut warned_rate = None;

        while !self.shared.terminated.load(Ordering::Acquire) {
            for command in self.commands.drain() {
                match command {
                    AudioCommand::Null => {}
                    AudioCommand::SetDevice(device) => {
                        if self.switch_device(device) {
                            pending = None;
                        }
                    }
                }
            }

            feed.release_retired();
            self.shared
                .buffered
                .store(feed.blocks.capacity() - feed.blocks.free_len(), Ordering::Relaxed);

            let block = match pending.take() {
                Some(block) => block,
                None => match self.input.pop(self.poll) {
                    Some(block) => block,
                    None => continue,
                },
            };

            if !self.tap.is_active() || self.shared.device().is_none() {
                continue;
            }

            let device_rate = self.shared.format().map(|f| f.sample_rate);
            if let Some(device_rate) = device_rate {
                if block.sample_rate != device_rate && warned_rate != Some(block.sample_rate) {
                    warn!(
                        "audio engine {}: {} Hz block on a {} Hz device plays at the wrong speed",
                        self.id, block.sample_rate, device_rate
                    );
                    warned_rate = Some(block.sample_rate);
                }
            }

            if let Err(block) = feed.blocks.push(block) {
                pending = Some(block);
                thread::sleep(RING_FULL_BACKOFF);
            }
        }

        feed.release_retired();
        debug!("audio engine {} thread exiting", self.id);
    }

    /// Moves the engine to `device`, falling back to the current device when
    /// the new one cannot be opened. Returns `true` when stale audio was
    /// flushed.
    fn switch_device(&self, device: DeviceId) -> bool {
        let previous = self.shared.device();
        if previous == Some(device) {
            return false;
        }

        let flushed = self.input.flush();
        if let Some(previous) = previous {
            self.registry.unbind(previous, &self.tap);
        }
        // unbound: no callback can be inside the renderer any more
        let cleared = self.tap.clear();
        debug!(
            "audio engine {} flushed {} blocks before switching to device {}",
            self.id,
            flushed + cleared,
            device
        );

        match self.registry.bind(device, Arc::clone(&self.tap)) {
            Ok(format) => {
                self.shared.set_bound(Some((device, format)));
                info!("audio engine {} switched to device {}", self.id, device);
                return true;
            }
            Err(err) => warn!("audio engine {} cannot use device {}: {}", self.id, device, err),
        }

        let fallback = previous.map(|previous| (previous, self.registry.bind(previous, Arc::clone(&self.tap))));
        match fallback {
            Some((previous, Ok(format))) => {
                self.shared.set_bound(Some((previous, format)));
                info!("audio engine {} stays on device {}", self.id, previous);
            }
            Some((previous, Err(err))) => {
                error!("audio engine {} lost device {}: {}", self.id, previous, err);
                self.shared.set_bound(None);
            }
            None => self.shared.set_bound(None),
        }
        true
    }
}
