//! Signature-matching detector with a voice-rejection fallback

use super::profile::{cosine_similarity, frequency_profile};
use super::{ClickDetector, FrameContext, SpikeTracker, REFRACTORY_MS};
use crate::audio::{mean, Frame};

/// Fraction of the sensitivity a spike must exceed to be considered at all
pub const CANDIDATE_SPIKE_FACTOR: f32 = 0.5;

/// Fraction of the sensitivity a spike must exceed to be confirmed
pub const CONFIRM_SPIKE_FACTOR: f32 = 0.3;

/// Minimum profile similarity to the stored signature
pub const SIMILARITY_THRESHOLD: f32 = 0.85;

/// Low half must exceed the high half by this ratio to look like voice
pub const VOICE_LOW_HIGH_RATIO: f32 = 1.5;

/// Low half must also exceed this absolute energy to look like voice
pub const VOICE_MIN_LOW_ENERGY: f32 = 0.1;

/// Energy of the lower and upper halves of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSplit {
    pub low_energy: f32,
    pub high_energy: f32,
}

impl VoiceSplit {
    /// Split at `len / 2`; an odd middle bin goes to the upper half
    pub fn of(frame: &Frame) -> Self {
        let bins = frame.bins();
        let (low, high) = bins.split_at(bins.len() / 2);
        Self {
            low_energy: mean(low),
            high_energy: mean(high),
        }
    }

    /// Speech concentrates in low bins; clicks are broadband
    pub fn is_likely_voice(&self) -> bool {
        self.low_energy > self.high_energy * VOICE_LOW_HIGH_RATIO
            && self.low_energy > VOICE_MIN_LOW_ENERGY
    }
}

/// Matches frames against the calibrated signature when one exists, and
/// otherwise suppresses voice-shaped spikes.
#[derive(Debug, Clone, Default)]
pub struct AdvancedDetector {
    tracker: SpikeTracker,
}

impl AdvancedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> f32 {
        self.tracker.baseline()
    }
}

impl ClickDetector for AdvancedDetector {
    fn on_frame(&mut self, frame: &Frame, ctx: &FrameContext<'_>) -> bool {
        let spike = self.tracker.observe(frame.mean());
        let sensitivity = ctx.sensitivity;

        let accepted = match ctx.signature {
            Some(signature) => {
                if spike <= sensitivity * CANDIDATE_SPIKE_FACTOR {
                    return false;
                }
                let similarity = cosine_similarity(&frequency_profile(frame), &signature.profile);
                let matched = similarity > SIMILARITY_THRESHOLD
                    && spike > sensitivity * CONFIRM_SPIKE_FACTOR
                    && self.tracker.refractory_elapsed(ctx.now_ms, REFRACTORY_MS);
                if matched {
                    log::debug!("Click: similarity {:.3}, spike {:.3}", similarity, spike);
                } else {
                    log::trace!("Candidate rejected: similarity {:.3}, spike {:.3}", similarity, spike);
                }
                matched
            }
            None => {
                let split = VoiceSplit::of(frame);
                let voice = split.is_likely_voice();
                if voice && spike > sensitivity {
                    log::trace!(
                        "Voice-shaped spike ignored (low {:.3}, high {:.3})",
                        split.low_energy,
                        split.high_energy
                    );
                }
                spike > sensitivity
                    && !voice
                    && self.tracker.refractory_elapsed(ctx.now_ms, REFRACTORY_MS)
            }
        };

        if accepted {
            self.tracker.mark(ctx.now_ms);
        }
        accepted
    }

    fn reset(&mut self) {
        self.tracker.reset();
    }
}
