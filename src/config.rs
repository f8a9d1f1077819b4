use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio_io::DeviceId;
use crate::error::ConfigError;

pub const MIN_FFT_SIZE: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub spectrum: SpectrumSettings,
    pub audio: AudioSettings,
}

/// Factors of the two cascaded per-bin moving averages. `first` follows the
/// raw magnitudes, `second` follows the output of the first stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Smoothing {
    pub first: f32,
    pub second: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumSettings {
    pub fft_size: usize,
    pub waterfall_lines: usize,
    pub view_smoothing: Smoothing,
    pub full_smoothing: Smoothing,
    pub level_margin: f32,
    pub level_smoothing: f32,
    pub resampler_guard: usize,
    pub min_view_bandwidth: u32,
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        SpectrumSettings {
            fft_size: 2048,
            waterfall_lines: 512,
            view_smoothing: Smoothing {
                first: 0.55,
                second: 0.85,
            },
            full_smoothing: Smoothing {
                first: 0.65,
                second: 0.65,
            },
            level_margin: 1.0,
            level_smoothing: 0.05,
            resampler_guard: 512,
            min_view_bandwidth: 1_500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub output_device: Option<DeviceId>,
    pub gain: f32,
    pub preferred_sample_rate: u32,
    pub poll_interval_ms: u64,
    pub ring_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            output_device: None,
            gain: 1.0,
            preferred_sample_rate: 48_000,
            poll_interval_ms: 20,
            ring_capacity: 32,
        }
    }
}

fn unit_factor(v: f32, fallback: f32) -> f32 {
    if v.is_finite() && v > 0.0 {
        v.min(1.0)
    } else {
        fallback
    }
}

impl SpectrumSettings {
    pub fn sanitized(mut self) -> Self {
        let defaults = SpectrumSettings::default();
        self.fft_size = fft_size_floor(self.fft_size);
        self.waterfall_lines = self.waterfall_lines.max(1);
        self.view_smoothing.first = unit_factor(self.view_smoothing.first, defaults.view_smoothing.first);
        self.view_smoothing.second = unit_factor(self.view_smoothing.second, defaults.view_smoothing.second);
        self.full_smoothing.first = unit_factor(self.full_smoothing.first, defaults.full_smoothing.first);
        self.full_smoothing.second = unit_factor(self.full_smoothing.second, defaults.full_smoothing.second);
        self.level_smoothing = unit_factor(self.level_smoothing, defaults.level_smoothing);
        if !(self.level_margin.is_finite() && self.level_margin > 0.0) {
            self.level_margin = defaults.level_margin;
        }
        self.min_view_bandwidth = self.min_view_bandwidth.max(1);
        self
    }
}

/// Smallest even transform size not below `MIN_FFT_SIZE`.
pub fn fft_size_floor(requested: usize) -> usize {
    let size = requested.max(MIN_FFT_SIZE);
    size + size % 2
}

impl AudioSettings {
    pub fn sanitized(mut self) -> Self {
        if !(self.gain.is_finite() && self.gain >= 0.0) {
            self.gain = 1.0;
        }
        if self.preferred_sample_rate == 0 {
            self.preferred_sample_rate = 48_000;
        }
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.ring_capacity = self.ring_capacity.max(2);
        self
    }
}

impl Settings {
    pub fn sanitized(self) -> Self {
        Settings {
            spectrum: self.spectrum.sanitized(),
            audio: self.audio.sanitized(),
        }
    }
}

pub fn settings_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("sdr-pipeline.json")
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let data = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&data)?;
    Ok(settings.sanitized())
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let data = serde_json::to_string_pretty(settings)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.json")).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.spectrum.fft_size = 1024;
        settings.audio.output_device = Some(2);
        settings.audio.gain = 0.5;

        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path).expect("load"), settings);
    }

    #[test]
    fn partial_file_fills_in_defaults_and_clamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "spectrum": { "fft_size": 3, "level_margin": -2.0 } }"#).expect("write");

        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.spectrum.fft_size, MIN_FFT_SIZE);
        assert_eq!(settings.spectrum.level_margin, 1.0);
        assert_eq!(settings.spectrum.waterfall_lines, 512);
        assert_eq!(settings.audio, AudioSettings::default());
    }

    #[test]
    fn garbage_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").expect("write");
        assert!(matches!(load_settings(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn odd_fft_sizes_round_up() {
        assert_eq!(fft_size_floor(1023), 1024);
        assert_eq!(fft_size_floor(0), MIN_FFT_SIZE);
        assert_eq!(fft_size_floor(2048), 2048);
    }
}
