//! Calibration: collect click samples and average them into a signature

use super::profile::{frequency_profile, FrequencyProfile, PROFILE_BANDS};
use super::{SpikeTracker, CALIBRATION_REFRACTORY_MS, CALIBRATION_SPIKE_THRESHOLD};
use crate::audio::Frame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fewest samples a signature can be built from
pub const MIN_SIGNATURE_SAMPLES: usize = 3;

/// Clicks the user is asked to make during calibration
pub const TARGET_CALIBRATION_SAMPLES: usize = 5;

/// Signature errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Need at least {required} calibration clicks, got {found}")]
    InsufficientSamples { found: usize, required: usize },
}

/// One accepted click captured while calibrating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub profile: FrequencyProfile,
    pub energy: f32,
    pub timestamp: u64,
}

/// Averaged spectral fingerprint of the user's pen click
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickSignature {
    pub profile: FrequencyProfile,
    pub avg_energy: f32,
    pub sample_count: usize,
    /// Unix time in milliseconds
    pub created_at: u64,
}

/// Average `samples` into a signature stamped with `created_at`.
///
/// Fails when fewer than three samples are given.
pub fn build_signature(
    samples: &[CalibrationSample],
    created_at: u64,
) -> Result<ClickSignature, SignatureError> {
    if samples.len() < MIN_SIGNATURE_SAMPLES {
        return Err(SignatureError::InsufficientSamples {
            found: samples.len(),
            required: MIN_SIGNATURE_SAMPLES,
        });
    }

    let count = samples.len() as f32;
    let mut profile = [0.0f32; PROFILE_BANDS];
    for sample in samples {
        for (acc, value) in profile.iter_mut().zip(sample.profile.iter()) {
            *acc += value;
        }
    }
    for band in profile.iter_mut() {
        *band /= count;
    }

    let avg_energy = samples.iter().map(|s| s.energy).sum::<f32>() / count;

    Ok(ClickSignature {
        profile,
        avg_energy,
        sample_count: samples.len(),
        created_at,
    })
}

/// Collects calibration samples with a fixed-threshold spike detector
#[derive(Debug, Clone, Default)]
pub struct CalibrationRecorder {
    tracker: SpikeTracker,
    samples: Vec<CalibrationSample>,
}

impl CalibrationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one frame, returning the sample recorded from it if any
    pub fn on_frame(&mut self, frame: &Frame, now_ms: u64) -> Option<&CalibrationSample> {
        let energy = frame.mean();
        let spike = self.tracker.observe(energy);

        if spike > CALIBRATION_SPIKE_THRESHOLD
            && self.tracker.refractory_elapsed(now_ms, CALIBRATION_REFRACTORY_MS)
        {
            self.tracker.mark(now_ms);
            self.samples.push(CalibrationSample {
                profile: frequency_profile(frame),
                energy,
                timestamp: now_ms,
            });
            log::debug!(
                "Calibration sample {} recorded (energy {:.3}, spike {:.3})",
                self.samples.len(),
                energy,
                spike
            );
            return self.samples.last();
        }

        None
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_support::assert_approx;

    fn sample(profile: FrequencyProfile, energy: f32) -> CalibrationSample {
        CalibrationSample {
            profile,
            energy,
            timestamp: 0,
        }
    }

    fn click_frame(energy: f32) -> Frame {
        // Broadband with a bright top end
        let mut bins = vec![energy * 0.5; 128];
        for b in bins.iter_mut().skip(64) {
            *b = energy * 1.5;
        }
        Frame::new(bins)
    }

    #[test]
    fn builder_rejects_fewer_than_three_samples() {
        let s = sample([0.1; PROFILE_BANDS], 0.2);

        for n in 0..3 {
            let samples = vec![s.clone(); n];
            assert_eq!(
                build_signature(&samples, 0),
                Err(SignatureError::InsufficientSamples {
                    found: n,
                    required: 3
                })
            );
        }
        assert!(build_signature(&vec![s; 3], 0).is_ok());
    }

    #[test]
    fn builder_averages_profiles_band_wise_and_energy() {
        let samples = vec![
            sample([0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8], 0.2),
            sample([0.3, 0.2, 0.1, 0.0, 0.1, 0.2, 0.3, 0.4], 0.4),
            sample([0.2; PROFILE_BANDS], 0.6),
        ];

        let signature = build_signature(&samples, 1_700_000_000_000).unwrap();

        let expected = [0.2, 0.2, 0.2, 0.2, 0.26666668, 0.33333334, 0.4, 0.46666667];
        for (actual, expected) in signature.profile.iter().zip(expected.iter()) {
            assert_approx(*actual, *expected, 1e-6);
        }
        assert_approx(signature.avg_energy, 0.4, 1e-6);
        assert_eq!(signature.sample_count, 3);
        assert_eq!(signature.created_at, 1_700_000_000_000);
    }

    #[test]
    fn builder_is_order_independent() {
        let samples = vec![
            sample([0.1, 0.9, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8], 0.21),
            sample([0.3, 0.2, 0.1, 0.0, 0.1, 0.2, 0.3, 0.4], 0.37),
            sample([0.2, 0.4, 0.6, 0.8, 0.6, 0.4, 0.2, 0.0], 0.55),
            sample([0.7; PROFILE_BANDS], 0.12),
        ];
        let mut reversed = samples.clone();
        reversed.reverse();
        let mut rotated = samples.clone();
        rotated.rotate_left(1);

        let a = build_signature(&samples, 0).unwrap();
        for permuted in [reversed, rotated] {
            let b = build_signature(&permuted, 0).unwrap();
            for (x, y) in a.profile.iter().zip(b.profile.iter()) {
                assert_approx(*x, *y, 1e-6);
            }
            assert_approx(a.avg_energy, b.avg_energy, 1e-6);
        }
    }

    #[test]
    fn recorder_accepts_spikes_over_fixed_threshold() {
        let mut recorder = CalibrationRecorder::new();

        assert!(recorder.on_frame(&Frame::uniform(128, 0.05), 1_000).is_none());
        let recorded = recorder.on_frame(&click_frame(0.3), 1_300).cloned().unwrap();

        assert_eq!(recorded.timestamp, 1_300);
        assert_approx(recorded.energy, 0.3, 1e-5);
        assert_approx(recorded.profile[0], 0.15, 1e-5);
        assert_approx(recorded.profile[7], 0.45, 1e-5);
        assert_eq!(recorder.sample_count(), 1);
    }

    #[test]
    fn recorder_debounces_for_200ms() {
        let mut recorder = CalibrationRecorder::new();
        let silence = Frame::uniform(128, 0.0);

        assert!(recorder.on_frame(&click_frame(0.4), 1_000).is_some());
        recorder.on_frame(&silence, 1_060);
        recorder.on_frame(&silence, 1_120);
        // Clear spike, but only 180 ms after the last sample
        assert!(recorder.on_frame(&click_frame(0.4), 1_180).is_none());
        recorder.on_frame(&silence, 1_250);
        recorder.on_frame(&silence, 1_320);
        recorder.on_frame(&silence, 1_380);
        assert!(recorder.on_frame(&click_frame(0.4), 1_450).is_some());

        let samples = recorder.samples();
        assert_eq!(samples.len(), 2);
        assert!(samples[1].timestamp - samples[0].timestamp >= CALIBRATION_REFRACTORY_MS);
    }

    #[test]
    fn recorder_threshold_ignores_user_sensitivity_range() {
        let mut recorder = CalibrationRecorder::new();

        // Calibration gates on its own 0.08 threshold
        assert!(recorder.on_frame(&Frame::uniform(128, 0.07), 1_000).is_none());
        let mut recorder = CalibrationRecorder::new();
        assert!(recorder.on_frame(&Frame::uniform(128, 0.09), 1_000).is_some());
    }

    #[test]
    fn reset_empties_the_recorder() {
        let mut recorder = CalibrationRecorder::new();
        recorder.on_frame(&click_frame(0.4), 1_000);
        assert_eq!(recorder.samples().len(), 1);

        recorder.reset();
        assert_eq!(recorder.sample_count(), 0);
    }

    #[test]
    fn signature_serializes_with_camel_case_keys() {
        let signature = ClickSignature {
            profile: [0.5; PROFILE_BANDS],
            avg_energy: 0.25,
            sample_count: 4,
            created_at: 7,
        };

        let json = serde_json::to_value(&signature).unwrap();

        assert_eq!(json["avgEnergy"], 0.25);
        assert_eq!(json["sampleCount"], 4);
        assert_eq!(json["createdAt"], 7);
        let back: ClickSignature = serde_json::from_value(json).unwrap();
        assert_eq!(back, signature);
    }
}
