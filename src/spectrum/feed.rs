use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::block::IqBlock;
use crate::queue::SynchronizedQueue;

use super::{SpectralPipeline, SpectrumFrame, ViewWindow};

/// Display-side consumer of IQ blocks.
///
/// Each tick takes only the newest block available; older ones are
/// discarded so the display never lags behind the radio.
pub struct SpectrumFeed {
    input: Arc<SynchronizedQueue<IqBlock>>,
    pipeline: SpectralPipeline,
    view: Option<ViewWindow>,
    stale_blocks: u64,
}

impl SpectrumFeed {
    pub fn new(input: Arc<SynchronizedQueue<IqBlock>>, pipeline: SpectralPipeline) -> Self {
        SpectrumFeed {
            input,
            pipeline,
            view: None,
            stale_blocks: 0,
        }
    }

    pub fn input(&self) -> Arc<SynchronizedQueue<IqBlock>> {
        Arc::clone(&self.input)
    }

    pub fn pipeline(&self) -> &SpectralPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut SpectralPipeline {
        &mut self.pipeline
    }

    pub fn view(&self) -> Option<ViewWindow> {
        self.view
    }

    pub fn set_view(&mut self, center_frequency: i64, bandwidth: u32) {
        self.view = Some(ViewWindow::new(center_frequency, bandwidth));
    }

    pub fn clear_view(&mut self) {
        self.view = None;
    }

    /// Blocks skipped because a newer one was already waiting.
    pub fn stale_blocks(&self) -> u64 {
        self.stale_blocks
    }

    /// Waits up to `wait` for data, then renders the freshest block.
    pub fn tick(&mut self, wait: Duration) -> Option<Arc<SpectrumFrame>> {
        let mut block = self.input.pop(wait)?;
        while let Some(newer) = self.input.try_pop() {
            block = newer;
            self.stale_blocks += 1;
        }

        let frame = self.pipeline.process(&block, self.view);
        if self.view.is_some() && frame.is_some() && !self.pipeline.is_view() {
            info!("view reached the full capture bandwidth, leaving view mode");
            self.view = None;
        }
        if frame.is_none() {
            debug!("block at {} Hz produced no frame", block.frequency);
        }
        frame
    }
}
