use std::f32::consts::TAU;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader};

use crate::block::PcmBlock;

/// Interleaved float PCM held in memory.
pub struct AudioSource {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioSource {
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames() as f32 / self.sample_rate.max(1) as f32
    }

    /// Cuts the source into playback blocks of `frames_per_block` frames;
    /// the last block may be shorter.
    pub fn blocks(&self, frames_per_block: usize) -> impl Iterator<Item = PcmBlock> + '_ {
        let chunk = frames_per_block.max(1) * usize::from(self.channels.max(1));
        self.samples
            .chunks(chunk)
            .map(move |samples| PcmBlock::new(self.sample_rate, self.channels, samples.to_vec()))
    }
}

pub fn load_wav(path: &Path) -> Result<AudioSource> {
    let mut reader = WavReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(anyhow!("invalid channel count"));
    }

    let mut samples = Vec::new();

    match spec.sample_format {
        SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                samples.push(sample?);
            }
        }
        SampleFormat::Int => {
            let bits = spec.bits_per_sample as i32;
            let max = ((1i64 << (bits - 1)) - 1) as f32;
            if bits <= 16 {
                for sample in reader.samples::<i16>() {
                    samples.push(sample? as f32 / max);
                }
            } else {
                for sample in reader.samples::<i32>() {
                    samples.push(sample? as f32 / max);
                }
            }
        }
    }

    Ok(AudioSource {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

/// A mono sine at `amplitude`.
pub fn sine(frequency: f32, sample_rate: u32, seconds: f32, amplitude: f32) -> AudioSource {
    let rate = sample_rate.max(1);
    let frames = (seconds.max(0.0) * rate as f32) as usize;
    let step = TAU * frequency / rate as f32;
    let samples = (0..frames)
        .map(|n| amplitude * (step * n as f32).sin())
        .collect();
    AudioSource {
        samples,
        channels: 1,
        sample_rate: rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    #[test]
    fn int_wav_is_scaled_to_unit_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pcm16.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).expect("create");
        for v in [i16::MAX, 0, -i16::MAX, 16_384] {
            writer.write_sample(v).expect("write");
        }
        writer.finalize().expect("finalize");

        let source = load_wav(&path).expect("load");
        assert_eq!(source.channels, 2);
        assert_eq!(source.sample_rate, 22_050);
        assert_eq!(source.frames(), 2);
        assert!((source.samples[0] - 1.0).abs() < 1e-6);
        assert!((source.samples[2] + 1.0).abs() < 1e-6);
        assert!((source.samples[3] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_wav(Path::new("/nonexistent/input.wav")).err().expect("error");
        assert!(err.to_string().contains("input.wav"));
    }

    #[test]
    fn blocks_cover_the_source_in_order() {
        let source = sine(1_000.0, 48_000, 0.01, 0.5);
        assert_eq!(source.frames(), 480);
        let blocks: Vec<_> = source.blocks(128).collect();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3].frames(), 480 - 3 * 128);
        let joined: Vec<f32> = blocks.iter().flat_map(|b| b.samples.iter().copied()).collect();
        assert_eq!(joined, source.samples);
        assert!(blocks.iter().all(|b| b.sample_rate == 48_000 && b.channels == 1));
    }
}
