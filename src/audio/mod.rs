//! Spectral frame source: microphone capture and per-tick analysis frames

mod capture;
mod fft;
mod sources;

pub use capture::{AudioBuffer, AudioCaptureHandle, MicrophoneSource};
pub use fft::FftAnalyzer;
pub use sources::{list_input_devices, InputDevice};

use thiserror::Error;

/// Audio capability errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio capture unsupported: {0}")]
    Unsupported(String),
}

impl CaptureError {
    /// Short machine-readable kind, forwarded to the error sink
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied(_) => "permission_denied",
            CaptureError::DeviceUnavailable(_) => "device_unavailable",
            CaptureError::Unsupported(_) => "unsupported",
        }
    }
}

/// Capture configuration requested when acquiring a frame source
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    /// Transform size; frames carry `fft_size / 2` bins
    pub fft_size: usize,

    /// Time smoothing between consecutive frames (0-1)
    pub smoothing: f32,

    /// Magnitude mapped to 0.0
    pub min_decibels: f32,

    /// Magnitude mapped to 1.0
    pub max_decibels: f32,

    /// Input device name, or the host default when `None`
    pub device: Option<String>,
}

impl CaptureConstraints {
    /// Runtime listening: 256-point transform, heavy smoothing
    pub fn listening() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            device: None,
        }
    }

    /// Calibration: 512-point transform, light smoothing
    pub fn calibration() -> Self {
        Self {
            fft_size: 512,
            smoothing: 0.3,
            ..Self::listening()
        }
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Number of bins per frame
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::listening()
    }
}

/// One snapshot of per-bin energy, each bin in [0, 1]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    bins: Vec<f32>,
}

impl Frame {
    pub fn new(bins: Vec<f32>) -> Self {
        let bins = bins
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Self { bins }
    }

    /// Frame with every bin set to `value`
    pub fn uniform(len: usize, value: f32) -> Self {
        Self::new(vec![value; len])
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Mean bin energy; 0 for an empty frame
    pub fn mean(&self) -> f32 {
        mean(&self.bins)
    }
}

pub(crate) fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Live capture acquired from a [`FrameSource`]
pub trait FrameCapture: Send {
    /// Next analysis frame, or `None` when no new audio arrived since the
    /// last one. An error means the capture is gone and will not recover.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Stop capturing and free the device. Idempotent.
    fn release(&mut self);
}

/// Audio capability: hands out captures on request
pub trait FrameSource: Send {
    fn acquire(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn FrameCapture>, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_clamps_samples_into_unit_range() {
        let frame = Frame::new(vec![-0.5, 0.25, 1.5, f32::NAN, f32::INFINITY]);

        assert_eq!(frame.bins(), &[0.0, 0.25, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn empty_frame_has_zero_mean() {
        let frame = Frame::new(Vec::new());

        assert!(frame.is_empty());
        assert_eq!(frame.mean(), 0.0);
    }

    #[test]
    fn calibration_constraints_use_larger_transform_and_less_smoothing() {
        let listening = CaptureConstraints::listening();
        let calibration = CaptureConstraints::calibration();

        assert_eq!(listening.bin_count(), 128);
        assert_eq!(calibration.bin_count(), 256);
        assert!(calibration.smoothing < listening.smoothing);
        assert_eq!(calibration.min_decibels, listening.min_decibels);
    }

    #[test]
    fn capture_error_kinds_are_stable() {
        assert_eq!(
            CaptureError::PermissionDenied("x".into()).kind(),
            "permission_denied"
        );
        assert_eq!(
            CaptureError::DeviceUnavailable("x".into()).kind(),
            "device_unavailable"
        );
        assert_eq!(CaptureError::Unsupported("x".into()).kind(), "unsupported");
    }
}
