use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::frame::Modality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Camera,
    FingerprintReader,
    CardReader,
}

impl DeviceKind {
    pub fn modality(&self) -> Modality {
        match self {
            DeviceKind::Camera => Modality::Face,
            DeviceKind::FingerprintReader => Modality::Fingerprint,
            DeviceKind::CardReader => Modality::Card,
        }
    }

    /// Capability that enables forwarding this kind's frames to recognition.
    pub fn recognition_capability(&self) -> Capability {
        match self {
            DeviceKind::Camera => Capability::FaceDetect,
            DeviceKind::FingerprintReader => Capability::FingerprintMatch,
            DeviceKind::CardReader => Capability::CardRead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    FaceDetect,
    MotionDetect,
    FingerprintMatch,
    CardRead,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceStatus {
    Offline,
    Connecting,
    Online,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Online => "online",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static registration data for a capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        let mut capabilities = BTreeSet::new();
        capabilities.insert(kind.recognition_capability());
        Self {
            id: id.into(),
            kind,
            location: String::new(),
            endpoint: String::new(),
            capabilities,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    /// Whether captured frames go to the recognition pipeline.
    pub fn forwards_samples(&self) -> bool {
        self.capabilities
            .contains(&self.kind.recognition_capability())
    }
}

/// Point-in-time view of a registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub config: DeviceConfig,
    pub status: DeviceStatus,
    pub active: bool,
    pub streaming: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub calibration: Calibration,
    pub calibrated_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_needs_matching_capability() {
        let cam = DeviceConfig::new("cam-1", DeviceKind::Camera);
        assert!(cam.forwards_samples());

        let cam = cam.with_capabilities([Capability::MotionDetect]);
        assert!(!cam.forwards_samples());

        let reader = DeviceConfig::new("fp-1", DeviceKind::FingerprintReader)
            .with_capabilities([Capability::FaceDetect]);
        assert!(!reader.forwards_samples());
    }
}
