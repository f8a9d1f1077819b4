use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::block::PcmBlock;

fn f32_to_u32(v: f32) -> u32 {
    v.to_bits()
}

fn u32_to_f32(v: u32) -> f32 {
    f32::from_bits(v)
}

/// Read side of an engine's block stream, advanced by the hardware callback.
pub(crate) struct Renderer {
    incoming: HeapConsumer<Arc<PcmBlock>>,
    retired: HeapProducer<Arc<PcmBlock>>,
    current: Option<Arc<PcmBlock>>,
    cursor: usize,
    started: u64,
}

/// Engine-side ends of the two rings: new blocks go in, finished blocks come
/// back so their storage is released off the real-time thread.
pub(crate) struct BlockFeed {
    pub(crate) blocks: HeapProducer<Arc<PcmBlock>>,
    pub(crate) retired: HeapConsumer<Arc<PcmBlock>>,
}

impl BlockFeed {
    pub(crate) fn release_retired(&mut self) -> usize {
        let mut released = 0;
        while self.retired.pop().is_some() {
            released += 1;
        }
        released
    }
}

pub(crate) fn block_rings(capacity: usize) -> (BlockFeed, Renderer) {
    let (blocks, incoming) = HeapRb::<Arc<PcmBlock>>::new(capacity).split();
    // every block in flight can be retired at once
    let (retired, retired_rx) = HeapRb::<Arc<PcmBlock>>::new(capacity + 2).split();
    (
        BlockFeed {
            blocks,
            retired: retired_rx,
        },
        Renderer {
            incoming,
            retired,
            current: None,
            cursor: 0,
            started: 0,
        },
    )
}

impl Renderer {
    /// Adds `gain`-scaled audio into `out`. Returns `false` when the blocks
    /// ran out before the buffer was filled.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize, gain: f32) -> bool {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let mut frame = 0;

        while frame < frames {
            if self.current.is_none() {
                match self.incoming.pop() {
                    Some(block) => {
                        self.current = Some(block);
                        self.cursor = 0;
                        self.started += 1;
                    }
                    None => return false,
                }
            }

            let mut exhausted = true;
            if let Some(block) = &self.current {
                let block_channels = usize::from(block.channels.max(1));
                let available = block.samples.len().saturating_sub(self.cursor) / block_channels;
                let count = available.min(frames - frame);

                for i in 0..count {
                    let src = &block.samples[self.cursor + i * block_channels..][..block_channels];
                    let dst = &mut out[(frame + i) * channels..][..channels];
                    for (c, sample) in dst.iter_mut().enumerate() {
                        *sample += src[c.min(block_channels - 1)] * gain;
                    }
                }

                frame += count;
                self.cursor += count * block_channels;
                exhausted = block.samples.len().saturating_sub(self.cursor) < block_channels;
            }

            if exhausted {
                if let Some(done) = self.current.take() {
                    // the ring only fills if the engine thread stalls; then the
                    // block is freed here
                    let _ = self.retired.push(done);
                }
                self.cursor = 0;
            }
        }
        true
    }

    /// Drops the block in progress and everything still queued.
    pub(crate) fn clear(&mut self) -> usize {
        let mut dropped = usize::from(self.current.take().is_some());
        while self.incoming.pop().is_some() {
            dropped += 1;
        }
        self.cursor = 0;
        dropped
    }

    pub(crate) fn queued(&self) -> usize {
        self.incoming.len() + usize::from(self.current.is_some())
    }
}

/// What a device controller sees of one engine.
pub(crate) struct EngineTap {
    pub(crate) id: usize,
    renderer: Mutex<Renderer>,
    active: AtomicBool,
    gain: AtomicU32,
    underflows: AtomicU32,
    blocks_started: AtomicU64,
}

impl EngineTap {
    pub(crate) fn new(id: usize, renderer: Renderer, gain: f32) -> Self {
        EngineTap {
            id,
            renderer: Mutex::new(renderer),
            active: AtomicBool::new(true),
            gain: AtomicU32::new(f32_to_u32(gain)),
            underflows: AtomicU32::new(0),
            blocks_started: AtomicU64::new(0),
        }
    }

    /// Called from the hardware callback. Never waits on a lock.
    pub(crate) fn render(&self, out: &mut [f32], channels: usize) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut renderer) = self.renderer.try_lock() else {
            // the engine thread is resetting this renderer
            self.underflows.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !renderer.render(out, channels, self.gain()) {
            self.underflows.fetch_add(1, Ordering::Relaxed);
        }
        self.blocks_started.store(renderer.started, Ordering::Relaxed);
    }

    /// Adds callbacks that went silent before reaching this engine.
    pub(crate) fn count_underflows(&self, callbacks: u32) {
        if self.active.load(Ordering::Acquire) {
            self.underflows.fetch_add(callbacks, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear(&self) -> usize {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn gain(&self) -> f32 {
        u32_to_f32(self.gain.load(Ordering::Relaxed))
    }

    pub(crate) fn set_gain(&self, gain: f32) {
        self.gain.store(f32_to_u32(gain), Ordering::Relaxed);
    }

    pub(crate) fn underflows(&self) -> u32 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub(crate) fn blocks_started(&self) -> u64 {
        self.blocks_started.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(channels: u16, samples: Vec<f32>) -> Arc<PcmBlock> {
        PcmBlock::new(48_000, channels, samples).shared()
    }

    #[test]
    fn cursor_spans_callbacks() {
        let (mut feed, mut renderer) = block_rings(4);
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert!(feed.blocks.push(block(2, samples)).is_ok());

        let mut out = vec![0.0; 8];
        assert!(renderer.render(&mut out, 2, 1.0));
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);

        let mut out = vec![0.0; 8];
        assert!(!renderer.render(&mut out, 2, 1.0));
        assert_eq!(out, vec![8.0, 9.0, 10.0, 11.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(feed.release_retired(), 1);
    }

    #[test]
    fn mono_is_spread_and_gain_applied() {
        let (mut feed, mut renderer) = block_rings(4);
        assert!(feed.blocks.push(block(1, vec![1.0, -1.0])).is_ok());
        let mut out = vec![0.0; 4];
        assert!(renderer.render(&mut out, 2, 0.5));
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn consecutive_blocks_play_without_gaps() {
        let (mut feed, mut renderer) = block_rings(4);
        assert!(feed.blocks.push(block(1, vec![1.0; 3])).is_ok());
        assert!(feed.blocks.push(block(1, vec![2.0; 3])).is_ok());
        let mut out = vec![0.0; 6];
        assert!(renderer.render(&mut out, 1, 1.0));
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(renderer.queued(), 0);
    }

    #[test]
    fn starved_tap_counts_underflow_and_stays_silent() {
        let (_feed, renderer) = block_rings(4);
        let tap = EngineTap::new(0, renderer, 1.0);
        let mut out = vec![0.0; 16];
        tap.render(&mut out, 2);
        tap.render(&mut out, 2);
        assert_eq!(tap.underflows(), 2);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn inactive_tap_leaves_blocks_queued() {
        let (mut feed, renderer) = block_rings(4);
        assert!(feed.blocks.push(block(1, vec![1.0; 4])).is_ok());
        let tap = EngineTap::new(0, renderer, 1.0);
        tap.set_active(false);
        let mut out = vec![0.0; 4];
        tap.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(tap.underflows(), 0);
        assert_eq!(tap.queued(), 1);
    }
}
