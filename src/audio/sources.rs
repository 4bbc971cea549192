//! Input device enumeration

use super::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

/// Microphone information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDevice {
    /// Unique identifier for the device (`input:<name>`)
    pub id: String,

    /// Display name, also accepted as `CaptureConstraints::device`
    pub name: String,

    /// Whether this is the host's default input
    pub is_default: bool,
}

impl InputDevice {
    fn from_name(name: String, default_name: Option<&str>) -> Self {
        Self {
            id: format!("input:{}", name),
            is_default: default_name == Some(name.as_str()),
            name,
        }
    }
}

/// List available input devices (microphones), default first
pub fn list_input_devices() -> Result<Vec<InputDevice>, CaptureError> {
    let host = cpal::default_host();

    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?;

    let mut sources: Vec<InputDevice> = devices
        .filter_map(|device| match device.name() {
            Ok(name) => Some(InputDevice::from_name(name, default_name.as_deref())),
            Err(e) => {
                log::warn!("Skipping input device without a name: {}", e);
                None
            }
        })
        .collect();

    sort_default_first(&mut sources);
    Ok(sources)
}

fn sort_default_first(sources: &mut [InputDevice]) {
    sources.sort_by_key(|s| !s.is_default);
}
