use thiserror::Error;

use crate::audio_io::DeviceId;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("output device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("no default output device")]
    NoDefaultDevice,
    #[error("output device {device} has no float32 stream configuration")]
    UnsupportedConfig { device: DeviceId },
    #[error("failed to open output device {device}: {reason}")]
    OpenFailed { device: DeviceId, reason: String },
    #[error("audio engine is already running")]
    AlreadyRunning,
    #[error("device enumeration failed: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("stream configuration query failed: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
    #[error("default stream configuration query failed: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("failed to spawn audio thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}
