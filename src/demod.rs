//! Control contract with a demodulator instance.
//!
//! The detection math lives elsewhere. This side only queues parameter
//! changes and exposes the values the demodulator has applied.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::command::CommandChannel;

pub const MIN_BANDWIDTH: u32 = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodCommand {
    Null,
    SetFrequency(i64),
    SetBandwidth(u32),
    SetSquelchEnabled(bool),
    SetStereo(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodulatorType {
    Fm,
    Am,
    Lsb,
    Usb,
}

impl DemodulatorType {
    fn to_u8(self) -> u8 {
        match self {
            DemodulatorType::Fm => 0,
            DemodulatorType::Am => 1,
            DemodulatorType::Lsb => 2,
            DemodulatorType::Usb => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => DemodulatorType::Am,
            2 => DemodulatorType::Lsb,
            3 => DemodulatorType::Usb,
            _ => DemodulatorType::Fm,
        }
    }
}

pub struct DemodulatorControl {
    commands: CommandChannel<DemodCommand>,
    frequency: AtomicI64,
    bandwidth: AtomicU32,
    squelch_enabled: AtomicBool,
    stereo: AtomicBool,
    kind: AtomicU8,
}

impl DemodulatorControl {
    pub fn new(frequency: i64, bandwidth: u32, kind: DemodulatorType) -> Self {
        DemodulatorControl {
            commands: CommandChannel::new(),
            frequency: AtomicI64::new(frequency),
            bandwidth: AtomicU32::new(bandwidth.max(MIN_BANDWIDTH)),
            squelch_enabled: AtomicBool::new(false),
            stereo: AtomicBool::new(false),
            kind: AtomicU8::new(kind.to_u8()),
        }
    }

    pub fn send(&self, command: DemodCommand) {
        self.commands.push(command);
    }

    pub fn frequency(&self) -> i64 {
        self.frequency.load(Ordering::Relaxed)
    }

    pub fn bandwidth(&self) -> u32 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    pub fn squelch_enabled(&self) -> bool {
        self.squelch_enabled.load(Ordering::Relaxed)
    }

    pub fn stereo(&self) -> bool {
        self.stereo.load(Ordering::Relaxed)
    }

    pub fn demodulator_type(&self) -> DemodulatorType {
        DemodulatorType::from_u8(self.kind.load(Ordering::Relaxed))
    }

    /// Called by the demodulator thread between blocks. Applies every pending
    /// command in order and returns them so the caller can retune its DSP.
    pub fn apply_pending(&self) -> Vec<DemodCommand> {
        let applied: Vec<_> = self.commands.drain().collect();
        for command in &applied {
            match *command {
                DemodCommand::Null => {}
                DemodCommand::SetFrequency(freq) => {
                    self.frequency.store(freq, Ordering::Relaxed);
                }
                DemodCommand::SetBandwidth(bw) => {
                    self.bandwidth.store(bw.max(MIN_BANDWIDTH), Ordering::Relaxed);
                }
                DemodCommand::SetSquelchEnabled(enabled) => {
                    self.squelch_enabled.store(enabled, Ordering::Relaxed);
                }
                DemodCommand::SetStereo(stereo) => {
                    self.stereo.store(stereo, Ordering::Relaxed);
                }
            }
        }
        applied
    }
}

/// Keeps a requested demodulator bandwidth inside `[MIN_BANDWIDTH, sample_rate]`.
pub fn clamp_bandwidth(requested: i64, sample_rate: u32) -> u32 {
    let ceiling = i64::from(sample_rate.max(MIN_BANDWIDTH));
    requested.clamp(i64::from(MIN_BANDWIDTH), ceiling) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_commands_in_order() {
        let demod = DemodulatorControl::new(100_000_000, 200_000, DemodulatorType::Fm);
        demod.send(DemodCommand::SetFrequency(101_100_000));
        demod.send(DemodCommand::SetBandwidth(150_000));
        demod.send(DemodCommand::SetFrequency(99_500_000));
        demod.send(DemodCommand::SetStereo(true));

        // nothing changes until the processing side drains
        assert_eq!(demod.frequency(), 100_000_000);

        let applied = demod.apply_pending();
        assert_eq!(applied.len(), 4);
        assert_eq!(demod.frequency(), 99_500_000);
        assert_eq!(demod.bandwidth(), 150_000);
        assert!(demod.stereo());
        assert!(!demod.squelch_enabled());
        assert!(demod.apply_pending().is_empty());
    }

    #[test]
    fn bandwidth_is_clamped() {
        assert_eq!(clamp_bandwidth(100, 2_400_000), MIN_BANDWIDTH);
        assert_eq!(clamp_bandwidth(5_000_000, 2_400_000), 2_400_000);
        assert_eq!(clamp_bandwidth(12_500, 2_400_000), 12_500);

        let demod = DemodulatorControl::new(0, 10, DemodulatorType::Am);
        assert_eq!(demod.bandwidth(), MIN_BANDWIDTH);
        demod.send(DemodCommand::SetBandwidth(0));
        demod.apply_pending();
        assert_eq!(demod.bandwidth(), MIN_BANDWIDTH);
        assert_eq!(demod.demodulator_type(), DemodulatorType::Am);
    }
}
