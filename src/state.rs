//! Settings and session status

use crate::detection::{clamp_sensitivity, DEFAULT_SENSITIVITY};
use crate::dose::PenProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which detector runs while listening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Volume spike over the smoothed baseline
    #[default]
    Simple,
    /// Signature matching, or voice rejection without a signature
    Advanced,
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Simple => write!(f, "simple"),
            DetectionMode::Advanced => write!(f, "advanced"),
        }
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(DetectionMode::Simple),
            "advanced" => Ok(DetectionMode::Advanced),
            other => Err(format!("Unknown detection mode: {}", other)),
        }
    }
}

/// User settings, persisted under the `settings` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub mode: DetectionMode,

    /// Spike threshold, kept within [0.05, 0.4]
    pub sensitivity: f32,

    /// Pen used to convert clicks into milligrams
    pub pen: PenProfile,

    /// Input device name; host default when `None`
    pub device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            sensitivity: DEFAULT_SENSITIVITY,
            pen: PenProfile::default(),
            device: None,
        }
    }
}

impl Settings {
    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.sensitivity = clamp_sensitivity(sensitivity);
        self
    }

    /// Settings with every field brought back into range
    pub fn sanitized(self) -> Self {
        let sensitivity = self.sensitivity;
        self.with_sensitivity(sensitivity)
    }
}

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Calibrating,
}

/// Snapshot of the controller for front-ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub click_count: u32,
    pub calibration_samples: usize,
    pub has_signature: bool,
    pub mode: DetectionMode,
    pub sensitivity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{MAX_SENSITIVITY, MIN_SENSITIVITY};

    #[test]
    fn default_settings_are_simple_mode_at_0_15() {
        let settings = Settings::default();

        assert_eq!(settings.mode, DetectionMode::Simple);
        assert_eq!(settings.sensitivity, 0.15);
        assert!(settings.device.is_none());
    }

    #[test]
    fn detection_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DetectionMode::Simple).unwrap(), "\"simple\"");
        assert_eq!(serde_json::to_string(&DetectionMode::Advanced).unwrap(), "\"advanced\"");
    }

    #[test]
    fn detection_mode_parses_case_insensitively() {
        assert_eq!("Advanced".parse::<DetectionMode>(), Ok(DetectionMode::Advanced));
        assert_eq!("simple".parse::<DetectionMode>(), Ok(DetectionMode::Simple));
        assert!("fancy".parse::<DetectionMode>().is_err());
    }

    #[test]
    fn sanitized_clamps_out_of_range_sensitivity() {
        let low = Settings {
            sensitivity: 0.0,
            ..Settings::default()
        };
        let high = Settings {
            sensitivity: 3.0,
            ..Settings::default()
        };

        assert_eq!(low.sanitized().sensitivity, MIN_SENSITIVITY);
        assert_eq!(high.sanitized().sensitivity, MAX_SENSITIVITY);
    }

    #[test]
    fn partial_settings_fill_from_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"mode":"advanced","sensitivity":0.2}"#).unwrap();

        assert_eq!(settings.mode, DetectionMode::Advanced);
        assert_eq!(settings.sensitivity, 0.2);
        assert_eq!(settings.pen, PenProfile::default());
    }

    #[test]
    fn default_status_is_idle() {
        let status = SessionStatus::default();

        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.click_count, 0);
        assert!(!status.has_signature);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["clickCount"], 0);
    }
}
