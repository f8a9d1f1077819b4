//! Numerically controlled oscillator used to translate a block in frequency.

use std::f32::consts::PI;

use rustfft::num_complex::Complex32;

/// Phase-accumulator oscillator producing `e^(j*phase)`.
#[derive(Clone, Debug, Default)]
pub struct Nco {
    /// Current phase in radians, kept within [-π, π].
    phase: f32,
    /// Phase increment per sample in radians.
    phase_inc: f32,
}

impl Nco {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the angular frequency in radians per sample.
    pub fn set_frequency(&mut self, radians_per_sample: f32) {
        self.phase_inc = radians_per_sample;
    }

    /// Sets the frequency from a shift in Hz at the given sample rate.
    pub fn tune(&mut self, shift_hz: f32, sample_rate: f32) {
        self.set_frequency(2.0 * PI * shift_hz / sample_rate);
    }

    pub fn frequency(&self) -> f32 {
        self.phase_inc
    }

    pub fn phase(&self) -> f32 {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    #[inline]
    fn advance(&mut self) {
        self.phase = wrap_phase(self.phase + self.phase_inc);
    }

    #[inline]
    fn next_lo(&mut self) -> Complex32 {
        let (sin, cos) = self.phase.sin_cos();
        self.advance();
        Complex32::new(cos, sin)
    }

    /// Shifts `input` up by the oscillator frequency into `output`.
    ///
    /// Only `min(input.len(), output.len())` samples are produced.
    pub fn mix_block_up(&mut self, input: &[Complex32], output: &mut [Complex32]) {
        for (dst, src) in output.iter_mut().zip(input) {
            *dst = *src * self.next_lo();
        }
    }

    /// Shifts `input` down by the oscillator frequency into `output`.
    pub fn mix_block_down(&mut self, input: &[Complex32], output: &mut [Complex32]) {
        for (dst, src) in output.iter_mut().zip(input) {
            *dst = *src * self.next_lo().conj();
        }
    }
}

/// Wrap phase to range [-π, π].
#[inline]
fn wrap_phase(phase: f32) -> f32 {
    let mut p = phase;
    while p > PI {
        p -= 2.0 * PI;
    }
    while p < -PI {
        p += 2.0 * PI;
    }
    p
}
