//! FFT analysis - turns raw mono samples into normalized spectral frames

use super::{CaptureConstraints, Frame};
use rustfft::{num_complex::Complex, FftPlanner};

/// Analyser producing one spectral frame per call.
///
/// Magnitudes are blended with the previous frame by the smoothing constant,
/// converted to decibels and mapped linearly from the
/// `[min_decibels, max_decibels]` window onto `[0, 1]`.
pub struct FftAnalyzer {
    planner: FftPlanner<f32>,
    fft_size: usize,
    window: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,

    // Smoothed magnitudes carried across frames
    smoothed: Vec<f32>,
}

impl FftAnalyzer {
    /// Create new FFT analyzer
    pub fn new(constraints: &CaptureConstraints) -> Self {
        let fft_size = constraints.fft_size.max(2);

        // Create Hann window
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        Self {
            planner: FftPlanner::new(),
            fft_size,
            window,
            smoothing: constraints.smoothing.clamp(0.0, 1.0),
            min_decibels: constraints.min_decibels,
            max_decibels: constraints.max_decibels,
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    /// Get FFT size
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Forget smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Analyze the most recent `fft_size` samples
    pub fn analyze(&mut self, samples: &[f32]) -> Option<Frame> {
        if samples.len() < self.fft_size {
            return None;
        }

        let recent = &samples[samples.len() - self.fft_size..];
        let mut buffer: Vec<Complex<f32>> = recent
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();

        let fft = self.planner.plan_fft_forward(self.fft_size);
        fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = (self.max_decibels - self.min_decibels).max(f32::EPSILON);
        let tau = self.smoothing;

        let bins = buffer
            .iter()
            .take(self.fft_size / 2)
            .zip(self.smoothed.iter_mut())
            .map(|(c, prev)| {
                let magnitude = c.norm() * scale;
                *prev = tau * *prev + (1.0 - tau) * magnitude;
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                ((db - self.min_decibels) / range).clamp(0.0, 1.0)
            })
            .collect();

        Some(Frame::new(bins))
    }
}
