//! Click to milligram conversion and saved dose records

use crate::state::DetectionMode;
use serde::{Deserialize, Serialize};

/// Dosing pen calibration constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenProfile {
    pub name: String,

    /// Medication delivered per mechanical click
    pub mg_per_click: f32,
}

impl Default for PenProfile {
    fn default() -> Self {
        Self {
            name: "Generic pen".to_string(),
            mg_per_click: 0.1,
        }
    }
}

impl PenProfile {
    pub fn new(name: impl Into<String>, mg_per_click: f32) -> Self {
        Self {
            name: name.into(),
            mg_per_click,
        }
    }

    pub fn dose_mg(&self, clicks: u32) -> f32 {
        clicks as f32 * self.mg_per_click
    }
}

/// One saved listening session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseRecord {
    pub clicks: u32,
    pub mg: f32,
    pub mode: DetectionMode,
    /// Unix time in milliseconds
    pub recorded_at: u64,
}

impl DoseRecord {
    pub fn new(clicks: u32, pen: &PenProfile, mode: DetectionMode, recorded_at: u64) -> Self {
        Self {
            clicks,
            mg: pen.dose_mg(clicks),
            mode,
            recorded_at,
        }
    }
}
