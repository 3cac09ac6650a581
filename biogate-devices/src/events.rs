use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::frame::Frame;
use crate::health::DeviceHealth;

/// A frame forwarded from a capture loop to recognition.
#[derive(Debug, Clone)]
pub struct CapturedSample {
    pub device_id: String,
    pub frame: Frame,
}

/// Device lifecycle notifications published on the registry's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeviceEvent {
    Registered { device_id: String },
    Connected { device_id: String },
    Disconnected { device_id: String },
    CaptureStarted { device_id: String },
    CaptureStopped { device_id: String },
    Fault {
        device_id: String,
        error: String,
        error_count: u64,
        fatal: bool,
    },
    Calibrated {
        device_id: String,
        calibration: Calibration,
    },
    Health(DeviceHealth),
    Deactivated { device_id: String },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Registered { device_id }
            | DeviceEvent::Connected { device_id }
            | DeviceEvent::Disconnected { device_id }
            | DeviceEvent::CaptureStarted { device_id }
            | DeviceEvent::CaptureStopped { device_id }
            | DeviceEvent::Fault { device_id, .. }
            | DeviceEvent::Calibrated { device_id, .. }
            | DeviceEvent::Deactivated { device_id } => device_id,
            DeviceEvent::Health(h) => &h.device_id,
        }
    }
}
