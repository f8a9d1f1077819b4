use std::sync::Arc;

use rustfft::num_complex::Complex32;

/// Wide-band complex samples handed from the sample source to the display
/// pipeline. Ownership moves with the block; nothing mutates it once queued.
#[derive(Debug, Clone, Default)]
pub struct IqBlock {
    pub frequency: i64,
    pub sample_rate: u32,
    pub bandwidth: u32,
    pub samples: Vec<Complex32>,
}

impl IqBlock {
    pub fn new(frequency: i64, sample_rate: u32, samples: Vec<Complex32>) -> Self {
        IqBlock {
            frequency,
            sample_rate,
            bandwidth: sample_rate,
            samples,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Interleaved demodulated audio. Blocks travel as `Arc<PcmBlock>` so the
/// producer can keep a handle while the output engine drains it.
#[derive(Debug, Clone, Default)]
pub struct PcmBlock {
    pub frequency: i64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl PcmBlock {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        PcmBlock {
            frequency: 0,
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            ch => self.samples.len() / usize::from(ch),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn shared(self) -> Arc<PcmBlock> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_ignore_trailing_partial_frame() {
        let block = PcmBlock::new(48_000, 2, vec![0.0; 9]);
        assert_eq!(block.frames(), 4);
        assert!(PcmBlock::new(48_000, 0, vec![0.5; 4]).is_empty());
    }

    #[test]
    fn iq_block_defaults_bandwidth_to_rate() {
        let block = IqBlock::new(100_000_000, 2_400_000, Vec::new());
        assert_eq!(block.bandwidth, 2_400_000);
        assert!(block.is_empty());
        assert_eq!(block.with_bandwidth(2_000_000).bandwidth, 2_000_000);
    }
}
