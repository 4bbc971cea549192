//! Volume-spike detector

use super::{ClickDetector, FrameContext, SpikeTracker, REFRACTORY_MS};
use crate::audio::Frame;

/// Fires when the frame's mean energy jumps above the smoothed baseline by
/// more than the sensitivity threshold.
#[derive(Debug, Clone, Default)]
pub struct SimpleDetector {
    tracker: SpikeTracker,
}

impl SimpleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> f32 {
        self.tracker.baseline()
    }
}

impl ClickDetector for SimpleDetector {
    fn on_frame(&mut self, frame: &Frame, ctx: &FrameContext<'_>) -> bool {
        let spike = self.tracker.observe(frame.mean());

        if spike > ctx.sensitivity && self.tracker.refractory_elapsed(ctx.now_ms, REFRACTORY_MS) {
            self.tracker.mark(ctx.now_ms);
            log::debug!("Click: spike {:.3} over threshold {:.3}", spike, ctx.sensitivity);
            return true;
        }

        false
    }

    fn reset(&mut self) {
        self.tracker.reset();
    }
}
