//! Spectral display pipeline.
//!
//! Turns wide-band IQ blocks into normalized spectrum frames. In view mode
//! the block is first translated so the view centre sits at DC, then
//! resampled down to the view bandwidth before the transform.

pub mod feed;
pub mod level;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::block::IqBlock;
use crate::config::{fft_size_floor, SpectrumSettings};
use crate::dsp::{Nco, Resampler};

pub use feed::SpectrumFeed;
pub use level::AutoLevel;

const ZERO: Complex32 = Complex32::new(0.0, 0.0);

/// Zoomed sub-band request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewWindow {
    pub center_frequency: i64,
    pub bandwidth: u32,
}

impl ViewWindow {
    pub fn new(center_frequency: i64, bandwidth: u32) -> Self {
        ViewWindow {
            center_frequency,
            bandwidth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumPoint {
    pub x: f32,
    pub level: f32,
}

#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub sequence: u64,
    pub center_frequency: i64,
    pub bandwidth: u32,
    pub view: bool,
    pub points: Vec<SpectrumPoint>,
}

impl SpectrumFrame {
    /// Index and point of the loudest bin.
    pub fn peak(&self) -> Option<(usize, SpectrumPoint)> {
        self.points
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.level.total_cmp(&b.1.level))
    }
}

/// Latest-frame cell read by a renderer.
#[derive(Default)]
pub struct SpectrumSlot {
    frame: Mutex<Option<Arc<SpectrumFrame>>>,
}

impl SpectrumSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(SpectrumSlot::default())
    }

    pub fn publish(&self, frame: Arc<SpectrumFrame>) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Arc<SpectrumFrame>> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Most recent frames, newest first.
#[derive(Debug, Default)]
pub struct WaterfallHistory {
    lines: usize,
    rows: VecDeque<Arc<SpectrumFrame>>,
}

impl WaterfallHistory {
    fn new(lines: usize) -> Self {
        WaterfallHistory {
            lines,
            rows: VecDeque::with_capacity(lines),
        }
    }

    fn push(&mut self, frame: Arc<SpectrumFrame>) {
        self.rows.push_front(frame);
        self.rows.truncate(self.lines);
    }

    fn resize(&mut self, lines: usize) {
        self.lines = lines;
        self.rows.clear();
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Arc<SpectrumFrame>> {
        self.rows.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildCounts {
    pub fft_plans: usize,
    pub resamplers: usize,
}

pub struct SpectralPipeline {
    settings: SpectrumSettings,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    transform_in: Vec<Complex32>,
    transform_out: Vec<Complex32>,
    scratch: Vec<Complex32>,

    nco: Nco,
    shift_frequency: i64,
    shift_rate: u32,
    shift_active: bool,
    shift_buffer: Vec<Complex32>,

    resampler: Option<Resampler>,
    resample_buffer: Vec<Complex32>,
    last_view_bandwidth: u32,
    last_input_bandwidth: u32,

    magnitudes: Vec<f32>,
    smoothed: Vec<f32>,
    smoothed_twice: Vec<f32>,
    level: AutoLevel,

    view_active: bool,
    sequence: u64,
    rebuilds: RebuildCounts,

    output: Arc<SpectrumSlot>,
    mirror: Option<Arc<SpectrumSlot>>,
    waterfall: WaterfallHistory,
}

impl SpectralPipeline {
    pub fn new(settings: SpectrumSettings) -> Self {
        let settings = settings.sanitized();
        let fft_size = settings.fft_size;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let scratch = vec![ZERO; fft.get_inplace_scratch_len()];
        let level = AutoLevel::new(settings.level_margin, settings.level_smoothing);
        let waterfall = WaterfallHistory::new(settings.waterfall_lines);

        SpectralPipeline {
            fft_size,
            fft,
            transform_in: vec![ZERO; fft_size],
            transform_out: vec![ZERO; fft_size],
            scratch,
            nco: Nco::new(),
            shift_frequency: 0,
            shift_rate: 0,
            shift_active: false,
            shift_buffer: Vec::new(),
            resampler: None,
            resample_buffer: Vec::new(),
            last_view_bandwidth: 0,
            last_input_bandwidth: 0,
            magnitudes: vec![0.0; fft_size],
            smoothed: vec![0.0; fft_size],
            smoothed_twice: vec![0.0; fft_size],
            level,
            view_active: false,
            sequence: 0,
            rebuilds: RebuildCounts {
                fft_plans: 1,
                resamplers: 0,
            },
            output: SpectrumSlot::new(),
            mirror: None,
            waterfall,
            settings,
        }
    }

    /// Changes transform size and waterfall depth. Calling it with the current
    /// values does nothing; otherwise the plan is rebuilt and the smoothing
    /// state starts over.
    pub fn setup(&mut self, fft_size: usize, waterfall_lines: usize) {
        let fft_size = fft_size_floor(fft_size);
        let waterfall_lines = waterfall_lines.max(1);
        if fft_size == self.fft_size && waterfall_lines == self.waterfall.lines() {
            return;
        }

        if fft_size != self.fft_size {
            debug!("rebuilding fft plan: {} -> {} bins", self.fft_size, fft_size);
            self.fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
            self.scratch = vec![ZERO; self.fft.get_inplace_scratch_len()];
            self.fft_size = fft_size;
            self.settings.fft_size = fft_size;
            self.rebuilds.fft_plans += 1;
        }

        self.transform_in = vec![ZERO; fft_size];
        self.transform_out = vec![ZERO; fft_size];
        self.magnitudes = vec![0.0; fft_size];
        self.smoothed = vec![0.0; fft_size];
        self.smoothed_twice = vec![0.0; fft_size];
        self.level.reset();
        self.settings.waterfall_lines = waterfall_lines;
        self.waterfall.resize(waterfall_lines);
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn settings(&self) -> &SpectrumSettings {
        &self.settings
    }

    pub fn rebuild_counts(&self) -> RebuildCounts {
        self.rebuilds
    }

    /// Whether the last processed block was rendered as a zoomed view.
    pub fn is_view(&self) -> bool {
        self.view_active
    }

    pub fn level_bounds(&self) -> (f32, f32) {
        self.level.bounds()
    }

    /// Samples handed to the last transform.
    pub fn transform_input(&self) -> &[Complex32] {
        &self.transform_in
    }

    pub fn output(&self) -> Arc<SpectrumSlot> {
        Arc::clone(&self.output)
    }

    pub fn waterfall(&self) -> &WaterfallHistory {
        &self.waterfall
    }

    /// Mirrors every frame into `slot`, replacing any previous mirror.
    pub fn attach_mirror(&mut self, slot: Arc<SpectrumSlot>) {
        self.mirror = Some(slot);
    }

    pub fn detach_mirror(&mut self) {
        self.mirror = None;
    }

    /// Runs one block through the pipeline. Returns `None` when the block
    /// carries nothing to show.
    pub fn process(&mut self, block: &IqBlock, view: Option<ViewWindow>) -> Option<Arc<SpectrumFrame>> {
        if block.is_empty() {
            return None;
        }

        let view = match view {
            Some(view) if block.frequency == 0 || block.bandwidth == 0 || block.sample_rate == 0 => {
                debug!("skipping block without tuning metadata for view {:?}", view);
                return None;
            }
            Some(view) => self.effective_view(block, view),
            None => None,
        };

        match view {
            Some(view) => {
                self.translate(block, view);
                self.resample(block, view);
                fill_transform(&mut self.transform_in, &self.resample_buffer);
            }
            None => fill_transform(&mut self.transform_in, &block.samples),
        }
        self.view_active = view.is_some();

        self.transform();
        let frame = Arc::new(self.level_frame(block, view));

        self.output.publish(Arc::clone(&frame));
        if let Some(mirror) = &self.mirror {
            mirror.publish(Arc::clone(&frame));
        }
        self.waterfall.push(Arc::clone(&frame));
        Some(frame)
    }

    fn effective_view(&mut self, block: &IqBlock, view: ViewWindow) -> Option<ViewWindow> {
        let bandwidth = view.bandwidth.max(self.settings.min_view_bandwidth);
        if bandwidth >= block.sample_rate {
            if self.view_active {
                debug!(
                    "view bandwidth {} reaches capture rate {}, showing full band",
                    bandwidth, block.sample_rate
                );
            }
            return None;
        }

        // keep the whole view inside the captured band
        let half_view = i64::from(bandwidth / 2);
        let half_rate = i64::from(block.sample_rate / 2);
        let mut center = view.center_frequency;
        if center < block.frequency && center - half_view < block.frequency - half_rate {
            center = block.frequency - half_rate + half_view;
        }
        if center > block.frequency && center + half_view > block.frequency + half_rate {
            center = block.frequency + half_rate - half_view;
        }
        if center != view.center_frequency {
            debug!("view centre {} moved to {} to stay in band", view.center_frequency, center);
        }
        Some(ViewWindow::new(center, bandwidth))
    }

    fn translate(&mut self, block: &IqBlock, view: ViewWindow) {
        let shift = view.center_frequency - block.frequency;

        self.shift_buffer.clear();
        if shift == 0 {
            self.shift_buffer.extend_from_slice(&block.samples);
            return;
        }

        if shift != self.shift_frequency || block.sample_rate != self.shift_rate {
            self.shift_frequency = shift;
            self.shift_rate = block.sample_rate;
            self.shift_active = shift.unsigned_abs() < u64::from(block.sample_rate / 2);
            if self.shift_active {
                self.nco.reset();
                self.nco.tune(shift.unsigned_abs() as f32, block.sample_rate as f32);
            } else {
                debug!("shift of {} Hz not representable at {} Hz", shift, block.sample_rate);
            }
        }

        if !self.shift_active {
            self.shift_buffer.extend_from_slice(&block.samples);
            return;
        }

        self.shift_buffer.resize(block.samples.len(), ZERO);
        if shift < 0 {
            self.nco.mix_block_up(&block.samples, &mut self.shift_buffer);
        } else {
            self.nco.mix_block_down(&block.samples, &mut self.shift_buffer);
        }
    }

    fn resample(&mut self, block: &IqBlock, view: ViewWindow) {
        let stale = self.resampler.is_none()
            || view.bandwidth != self.last_view_bandwidth
            || block.bandwidth != self.last_input_bandwidth;
        if stale {
            let ratio = f64::from(view.bandwidth) / f64::from(block.bandwidth);
            debug!("rebuilding resampler, ratio {:.6}", ratio);
            self.resampler = None;
            self.resampler = Some(Resampler::new(ratio));
            self.last_view_bandwidth = view.bandwidth;
            self.last_input_bandwidth = block.bandwidth;
            self.rebuilds.resamplers += 1;
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        let out_size = (block.samples.len() as f64 * resampler.ratio()).ceil() as usize
            + self.settings.resampler_guard;
        self.resample_buffer.clear();
        self.resample_buffer.reserve(out_size);
        resampler.process(&self.shift_buffer, &mut self.resample_buffer);
    }

    fn transform(&mut self) {
        self.transform_out.copy_from_slice(&self.transform_in);
        self.fft
            .process_with_scratch(&mut self.transform_out, &mut self.scratch);

        // negative frequencies first; bin 1 stands in for DC and bin n/2+1
        // for the Nyquist bin
        let half = self.fft_size / 2;
        for i in 0..half {
            let n = if i == 0 { 1 } else { i };
            self.magnitudes[i] = self.transform_out[half + n].norm();
            self.magnitudes[half + i] = self.transform_out[n].norm();
        }
    }

    fn level_frame(&mut self, block: &IqBlock, view: Option<ViewWindow>) -> SpectrumFrame {
        let smoothing = if view.is_some() {
            self.settings.view_smoothing
        } else {
            self.settings.full_smoothing
        };

        for i in 0..self.fft_size {
            self.smoothed_twice[i] += (self.smoothed[i] - self.smoothed_twice[i]) * smoothing.second;
            self.smoothed[i] += (self.magnitudes[i] - self.smoothed[i]) * smoothing.first;
        }

        let (ceiling, floor) = level::frame_extremes(&self.smoothed_twice);
        self.level.update(ceiling, floor);

        let bins = self.fft_size as f32;
        let points = self
            .smoothed_twice
            .iter()
            .enumerate()
            .map(|(i, &v)| SpectrumPoint {
                x: i as f32 / bins,
                level: self.level.normalize(v),
            })
            .collect();

        self.sequence += 1;
        let (center_frequency, bandwidth) = match view {
            Some(view) => (view.center_frequency, view.bandwidth),
            None => (block.frequency, block.bandwidth),
        };
        SpectrumFrame {
            sequence: self.sequence,
            center_frequency,
            bandwidth,
            view: view.is_some(),
            points,
        }
    }
}

/// Copies up to `dst.len()` samples and zeroes whatever `src` does not cover.
fn fill_transform(dst: &mut [Complex32], src: &[Complex32]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(fft_size: usize) -> SpectrumSettings {
        SpectrumSettings {
            fft_size,
            ..SpectrumSettings::default()
        }
    }

    fn ramp(len: usize) -> Vec<Complex32> {
        (0..len).map(|i| Complex32::new(i as f32, -(i as f32))).collect()
    }

    #[test]
    fn long_block_fills_transform_exactly() {
        let mut pipeline = SpectralPipeline::new(settings(256));
        let block = IqBlock::new(100_000_000, 48_000, ramp(1000));
        pipeline.process(&block, None).expect("frame");
        assert_eq!(pipeline.transform_input(), &block.samples[..256]);
    }

    #[test]
    fn short_block_is_zero_padded() {
        let mut pipeline = SpectralPipeline::new(settings(256));
        let block = IqBlock::new(100_000_000, 48_000, ramp(100));
        pipeline.process(&block, None).expect("frame");
        let input = pipeline.transform_input();
        assert_eq!(&input[..100], &block.samples[..]);
        assert!(input[100..].iter().all(|s| *s == ZERO));
    }

    #[test]
    fn empty_block_is_ignored() {
        let mut pipeline = SpectralPipeline::new(settings(256));
        assert!(pipeline.process(&IqBlock::default(), None).is_none());
        assert!(pipeline.output().latest().is_none());
    }

    #[test]
    fn setup_is_idempotent() {
        let mut pipeline = SpectralPipeline::new(settings(512));
        pipeline.setup(512, 512);
        assert_eq!(pipeline.rebuild_counts().fft_plans, 1);
        pipeline.setup(1024, 512);
        pipeline.setup(1024, 512);
        assert_eq!(pipeline.rebuild_counts().fft_plans, 2);
        assert_eq!(pipeline.fft_size(), 1024);
        pipeline.setup(1024, 64);
        assert_eq!(pipeline.rebuild_counts().fft_plans, 2);
        assert_eq!(pipeline.waterfall().lines(), 64);
    }

    #[test]
    fn dc_bin_is_taken_from_its_neighbour() {
        let mut pipeline = SpectralPipeline::new(settings(64));
        // pure DC: all energy lands in bin 0, which the display replaces
        let block = IqBlock::new(1_000, 48_000, vec![Complex32::new(1.0, 0.0); 64]);
        pipeline.process(&block, None).expect("frame");
        assert!(pipeline.magnitudes[32] < 1e-3);
    }

    #[test]
    fn frames_reach_mirror_and_waterfall() {
        let mut pipeline = SpectralPipeline::new(SpectrumSettings {
            fft_size: 64,
            waterfall_lines: 3,
            ..SpectrumSettings::default()
        });
        let mirror = SpectrumSlot::new();
        pipeline.attach_mirror(Arc::clone(&mirror));

        let block = IqBlock::new(1_000, 48_000, ramp(64));
        let mut last = None;
        for _ in 0..5 {
            last = pipeline.process(&block, None);
        }
        let last = last.expect("frame");
        let mirrored = mirror.latest().expect("mirrored frame");
        assert!(Arc::ptr_eq(&last, &mirrored));
        assert!(Arc::ptr_eq(&last, &pipeline.output().latest().expect("own frame")));
        assert_eq!(pipeline.waterfall().len(), 3);
        assert_eq!(pipeline.waterfall().rows().next().map(|f| f.sequence), Some(5));
    }

    #[test]
    fn view_wider_than_capture_falls_back_to_full_band() {
        let mut pipeline = SpectralPipeline::new(settings(64));
        let block = IqBlock::new(1_000_000, 48_000, ramp(64));
        let frame = pipeline
            .process(&block, Some(ViewWindow::new(1_000_000, 96_000)))
            .expect("frame");
        assert!(!frame.view);
        assert!(!pipeline.is_view());
        assert_eq!(pipeline.rebuild_counts().resamplers, 0);
    }

    #[test]
    fn view_near_band_edge_is_pulled_inside() {
        let mut pipeline = SpectralPipeline::new(settings(64));
        let block = IqBlock::new(100_000_000, 48_000, ramp(256));

        let frame = pipeline
            .process(&block, Some(ViewWindow::new(100_020_000, 12_000)))
            .expect("frame");
        assert!(frame.view);
        assert_eq!(frame.center_frequency, 100_018_000);
        assert_eq!(frame.bandwidth, 12_000);
        assert_eq!(pipeline.shift_frequency, 18_000);

        let frame = pipeline
            .process(&block, Some(ViewWindow::new(99_979_000, 12_000)))
            .expect("frame");
        assert_eq!(frame.center_frequency, 99_982_000);

        // already inside: untouched
        let frame = pipeline
            .process(&block, Some(ViewWindow::new(100_010_000, 12_000)))
            .expect("frame");
        assert_eq!(frame.center_frequency, 100_010_000);
    }

    #[test]
    fn unrepresentable_shift_passes_samples_through() {
        let mut pipeline = SpectralPipeline::new(settings(64));
        let block = IqBlock::new(100_000_000, 48_000, ramp(128));

        pipeline.translate(&block, ViewWindow::new(100_024_000, 6_000));
        assert!(!pipeline.shift_active);
        assert_eq!(pipeline.shift_buffer, block.samples);

        pipeline.translate(&block, ViewWindow::new(99_970_000, 6_000));
        assert!(!pipeline.shift_active);
        assert_eq!(pipeline.shift_buffer, block.samples);

        pipeline.translate(&block, ViewWindow::new(100_023_000, 6_000));
        assert!(pipeline.shift_active);
        assert_eq!(pipeline.shift_buffer.len(), block.samples.len());
        assert_ne!(pipeline.shift_buffer, block.samples);
    }

    #[test]
    fn oscillator_phase_carries_across_blocks() {
        use std::f32::consts::{PI, TAU};

        // phase of the oscillator after `cycles` turns, wrapped to [-π, π]
        fn wrapped(cycles: f32) -> f32 {
            let p = cycles.fract() * TAU;
            if p > PI {
                p - TAU
            } else {
                p
            }
        }

        let mut pipeline = SpectralPipeline::new(settings(64));
        let block = IqBlock::new(100_000_000, 48_000, ramp(100));
        let view = ViewWindow::new(100_001_000, 6_000);

        pipeline.process(&block, Some(view)).expect("frame");
        let first = pipeline.nco.phase();
        assert!((first - wrapped(100.0 / 48.0)).abs() < 1e-3, "phase {}", first);

        pipeline.process(&block, Some(view)).expect("frame");
        let second = pipeline.nco.phase();
        assert!((second - wrapped(200.0 / 48.0)).abs() < 1e-3, "phase {}", second);

        // a new shift starts the oscillator over
        pipeline
            .process(&block, Some(ViewWindow::new(100_001_500, 6_000)))
            .expect("frame");
        let third = pipeline.nco.phase();
        assert!((third - wrapped(100.0 * 1_500.0 / 48_000.0)).abs() < 1e-3, "phase {}", third);
    }

    #[test]
    fn view_needs_tuning_metadata() {
        let mut pipeline = SpectralPipeline::new(settings(64));
        let block = IqBlock::new(0, 48_000, ramp(64));
        assert!(pipeline.process(&block, Some(ViewWindow::new(0, 6_000))).is_none());
    }
}
