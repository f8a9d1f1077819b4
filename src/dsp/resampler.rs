//! Arbitrary-ratio complex resampler.
//!
//! Each output sample is a windowed-sinc interpolation of the input around a
//! fractional read position. The low-pass cutoff follows the lower of the two
//! rates, so decimation is alias-free. Input history is carried between
//! calls, which keeps block boundaries seamless.

use std::f64::consts::PI;

use rustfft::num_complex::Complex32;

/// Kernel zero crossings on each side of the centre tap.
const ZERO_CROSSINGS: usize = 10;
/// Table points per zero crossing.
const TABLE_RESOLUTION: usize = 256;
/// Passband edge relative to the output Nyquist rate.
const CUTOFF: f64 = 0.9;

pub struct Resampler {
    ratio: f64,
    step: f64,
    bandwidth: f64,
    half_width: usize,
    kernel: Vec<f32>,
    history: Vec<Complex32>,
    work: Vec<Complex32>,
    position: f64,
}

impl Resampler {
    /// `ratio` is output rate over input rate.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() && ratio > 0.0 { ratio } else { 1.0 };
        let bandwidth = ratio.min(1.0) * CUTOFF;
        let half_width = (ZERO_CROSSINGS as f64 / bandwidth).ceil() as usize;

        let kernel = (0..=ZERO_CROSSINGS * TABLE_RESOLUTION + 1)
            .map(|i| {
                let u = i as f64 / TABLE_RESOLUTION as f64;
                (sinc(u) * blackman(u / ZERO_CROSSINGS as f64)) as f32
            })
            .collect();

        Resampler {
            ratio,
            step: 1.0 / ratio,
            bandwidth,
            half_width,
            kernel,
            history: vec![Complex32::new(0.0, 0.0); 2 * half_width],
            work: Vec::new(),
            position: half_width as f64,
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn weight(&self, distance: f64) -> f32 {
        let u = distance.abs() * self.bandwidth * TABLE_RESOLUTION as f64;
        let index = u as usize;
        if index + 1 >= self.kernel.len() {
            return 0.0;
        }
        let frac = (u - index as f64) as f32;
        self.kernel[index] + (self.kernel[index + 1] - self.kernel[index]) * frac
    }

    /// Appends resampled output for `input` to `output` and returns how many
    /// samples were written.
    pub fn process(&mut self, input: &[Complex32], output: &mut Vec<Complex32>) -> usize {
        let mut work = std::mem::take(&mut self.work);
        work.clear();
        work.extend_from_slice(&self.history);
        work.extend_from_slice(input);

        let hw = self.half_width;
        let start_len = output.len();
        while (self.position as usize) + hw < work.len() {
            let centre = self.position as usize;
            let frac = self.position - centre as f64;
            let mut acc = Complex32::new(0.0, 0.0);
            let mut norm = 0.0f32;
            for k in (centre + 1 - hw)..=(centre + hw) {
                let w = self.weight(k as f64 - centre as f64 - frac);
                acc += work[k] * w;
                norm += w;
            }
            output.push(if norm.abs() > f32::EPSILON { acc / norm } else { acc });
            self.position += self.step;
        }

        let keep = 2 * hw;
        let drop = work.len() - keep;
        self.history.copy_from_slice(&work[drop..]);
        self.position -= drop as f64;
        self.work = work;

        output.len() - start_len
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Blackman window over `t` in [-1, 1], zero outside.
fn blackman(t: f64) -> f64 {
    if t.abs() >= 1.0 {
        return 0.0;
    }
    0.42 + 0.5 * (PI * t).cos() + 0.08 * (2.0 * PI * t).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(cycles_per_sample: f64, len: usize) -> Vec<Complex32> {
        (0..len)
            .map(|n| {
                let phase = 2.0 * PI * cycles_per_sample * n as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn output_count_tracks_ratio() {
        let mut resampler = Resampler::new(0.25);
        let mut out = Vec::new();
        let mut total = 0;
        for _ in 0..8 {
            total += resampler.process(&vec![Complex32::new(1.0, 0.0); 4096], &mut out);
        }
        assert_eq!(total, out.len());
        let expected = 8.0 * 4096.0 * 0.25;
        assert!((total as f64 - expected).abs() <= 2.0, "total = {total}");
    }

    #[test]
    fn dc_passes_with_unity_gain() {
        let mut resampler = Resampler::new(0.1);
        let mut out = Vec::new();
        resampler.process(&vec![Complex32::new(1.0, -0.5); 20_000], &mut out);
        let settled = &out[out.len() / 2..];
        for s in settled {
            assert!((s.re - 1.0).abs() < 1e-3 && (s.im + 0.5).abs() < 1e-3, "{s}");
        }
    }

    #[test]
    fn passband_tone_keeps_amplitude_across_blocks() {
        let mut resampler = Resampler::new(0.5);
        let input = tone(0.05, 8192);
        let mut out = Vec::new();
        for chunk in input.chunks(1000) {
            resampler.process(chunk, &mut out);
        }
        for s in &out[200..out.len() - 200] {
            assert!((s.norm() - 1.0).abs() < 0.02, "|s| = {}", s.norm());
        }
    }

    #[test]
    fn stopband_tone_is_rejected() {
        let mut resampler = Resampler::new(0.25);
        // 0.3 cycles per input sample is far above the new Nyquist of 0.125
        let input = tone(0.3, 16_384);
        let mut out = Vec::new();
        resampler.process(&input, &mut out);
        let peak = out[100..out.len() - 100]
            .iter()
            .map(|s| s.norm())
            .fold(0.0f32, f32::max);
        assert!(peak < 0.01, "peak = {peak}");
    }

    #[test]
    fn invalid_ratio_falls_back_to_unity() {
        let resampler = Resampler::new(0.0);
        assert_eq!(resampler.ratio(), 1.0);
    }
}
