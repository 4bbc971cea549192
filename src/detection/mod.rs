//! Click detection engine
//!
//! Every detector consumes one [`Frame`] per tick and reports whether a pen
//! click happened on that frame. Detectors share the same building block: an
//! exponential moving average of frame energy (the baseline) plus a
//! refractory gate that blocks a second click for a fixed window.

mod advanced;
mod calibration;
mod profile;
mod simple;

pub use advanced::{AdvancedDetector, VoiceSplit};
pub use calibration::{
    build_signature, CalibrationRecorder, CalibrationSample, ClickSignature, SignatureError,
    MIN_SIGNATURE_SAMPLES, TARGET_CALIBRATION_SAMPLES,
};
pub use profile::{cosine_similarity, frequency_profile, FrequencyProfile, PROFILE_BANDS};
pub use simple::SimpleDetector;

use crate::audio::Frame;
use crate::state::DetectionMode;

/// Weight kept from the previous baseline on every frame
pub const EMA_HISTORY_WEIGHT: f32 = 0.7;

/// Minimum time between two runtime clicks
pub const REFRACTORY_MS: u64 = 150;

/// Minimum time between two calibration samples
pub const CALIBRATION_REFRACTORY_MS: u64 = 200;

/// Fixed spike threshold used while calibrating
pub const CALIBRATION_SPIKE_THRESHOLD: f32 = 0.08;

/// Lowest (most sensitive) accepted sensitivity threshold
pub const MIN_SENSITIVITY: f32 = 0.05;

/// Highest (least sensitive) accepted sensitivity threshold
pub const MAX_SENSITIVITY: f32 = 0.4;

/// Default sensitivity threshold
pub const DEFAULT_SENSITIVITY: f32 = 0.15;

/// Clamp a user-provided sensitivity into the accepted range
pub fn clamp_sensitivity(sensitivity: f32) -> f32 {
    if sensitivity.is_nan() {
        return DEFAULT_SENSITIVITY;
    }
    sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
}

/// Smoothed-energy baseline and refractory timer.
///
/// `baseline` stays in [0, 1] because frame means do.
#[derive(Debug, Clone, Default)]
pub struct SpikeTracker {
    baseline: f32,
    last_event_ms: Option<u64>,
}

impl SpikeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rise of `energy` over the baseline, then fold `energy` into the baseline
    pub fn observe(&mut self, energy: f32) -> f32 {
        let spike = energy - self.baseline;
        self.baseline = (1.0 - EMA_HISTORY_WEIGHT) * energy + EMA_HISTORY_WEIGHT * self.baseline;
        spike
    }

    /// True when more than `window_ms` has passed since the last accepted event
    pub fn refractory_elapsed(&self, now_ms: u64, window_ms: u64) -> bool {
        match self.last_event_ms {
            Some(last) => now_ms.saturating_sub(last) > window_ms,
            None => true,
        }
    }

    pub fn mark(&mut self, now_ms: u64) {
        self.last_event_ms = Some(now_ms);
    }

    pub fn baseline(&self) -> f32 {
        self.baseline
    }

    pub fn last_event_ms(&self) -> Option<u64> {
        self.last_event_ms
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-frame inputs shared by all detectors
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub sensitivity: f32,
    pub signature: Option<&'a ClickSignature>,
    pub now_ms: u64,
}

/// A runtime click detector
pub trait ClickDetector {
    /// Consume one frame; `true` means exactly one click happened on it
    fn on_frame(&mut self, frame: &Frame, ctx: &FrameContext<'_>) -> bool;

    /// Forget baseline and refractory state
    fn reset(&mut self);
}

/// Detector selected by the configured mode
#[derive(Debug, Clone)]
pub enum Detector {
    Simple(SimpleDetector),
    Advanced(AdvancedDetector),
}

impl Detector {
    pub fn for_mode(mode: DetectionMode) -> Self {
        match mode {
            DetectionMode::Simple => Detector::Simple(SimpleDetector::new()),
            DetectionMode::Advanced => Detector::Advanced(AdvancedDetector::new()),
        }
    }

    pub fn mode(&self) -> DetectionMode {
        match self {
            Detector::Simple(_) => DetectionMode::Simple,
            Detector::Advanced(_) => DetectionMode::Advanced,
        }
    }
}

impl ClickDetector for Detector {
    fn on_frame(&mut self, frame: &Frame, ctx: &FrameContext<'_>) -> bool {
        match self {
            Detector::Simple(d) => d.on_frame(frame, ctx),
            Detector::Advanced(d) => d.on_frame(frame, ctx),
        }
    }

    fn reset(&mut self) {
        match self {
            Detector::Simple(d) => d.reset(),
            Detector::Advanced(d) => d.reset(),
        }
    }
}
