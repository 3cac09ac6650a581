//! JSON command surface over [`Engine`]. Each command yields an
//! [`ApiResponse`]; biometric rejections are successful responses whose data
//! carries the negative outcome.

use biogate_devices::{CalibrationUpdate, DeviceConfig, Frame, Modality};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::identity::IdentityId;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    RegisterDevice {
        device: DeviceConfig,
    },
    DeactivateDevice {
        device_id: String,
    },
    Connect {
        device_id: String,
    },
    Disconnect {
        device_id: String,
    },
    StartCapture {
        device_id: String,
    },
    StopCapture {
        device_id: String,
    },
    CaptureFrame {
        device_id: String,
    },
    Calibrate {
        device_id: String,
        #[serde(default)]
        calibration: CalibrationUpdate,
    },
    AutoCalibrate {
        device_id: String,
    },
    DeviceHealth {
        #[serde(default)]
        device_id: Option<String>,
    },
    ListDevices,
    Enroll {
        identity: IdentityId,
        modality: Modality,
        sample: Frame,
    },
    EnrollFromDevice {
        identity: IdentityId,
        device_id: String,
    },
    Identify {
        sample: Frame,
    },
    Verify {
        identity: IdentityId,
        sample: Frame,
    },
    Authenticate {
        identity: IdentityId,
        samples: Vec<Frame>,
        #[serde(default)]
        required_matches: Option<usize>,
    },
    Enrollment {
        identity: IdentityId,
    },
    Anomalies {
        #[serde(default)]
        identity: Option<IdentityId>,
        #[serde(default)]
        device_id: Option<String>,
    },
    RecentEvents {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    RecognitionStats,
    DeviceStats,
    ReviewQueue,
    Purge {
        identity: IdentityId,
    },
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
}

impl ApiResponse {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::error("internal", e.to_string()),
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(data) => Self::ok(&data),
            Err(e) => Self::error(e.kind(), e.to_string()),
        }
    }
}

impl Engine {
    pub async fn dispatch(&self, command: Command) -> ApiResponse {
        match command {
            Command::RegisterDevice { device } => {
                ApiResponse::from_result(self.register_device(device))
            }
            Command::DeactivateDevice { device_id } => {
                ApiResponse::from_result(self.deactivate_device(&device_id).await)
            }
            Command::Connect { device_id } => {
                ApiResponse::from_result(self.connect_device(&device_id).await)
            }
            Command::Disconnect { device_id } => {
                ApiResponse::from_result(self.disconnect_device(&device_id).await)
            }
            Command::StartCapture { device_id } => {
                ApiResponse::from_result(self.start_capture(&device_id).await)
            }
            Command::StopCapture { device_id } => {
                ApiResponse::from_result(self.stop_capture(&device_id).await)
            }
            Command::CaptureFrame { device_id } => {
                ApiResponse::from_result(self.capture_frame(&device_id).await)
            }
            Command::Calibrate {
                device_id,
                calibration,
            } => ApiResponse::from_result(self.calibrate_device(&device_id, &calibration).await),
            Command::AutoCalibrate { device_id } => {
                ApiResponse::from_result(self.auto_calibrate(&device_id).await)
            }
            Command::DeviceHealth { device_id: Some(id) } => {
                ApiResponse::from_result(self.device_health(&id).await)
            }
            Command::DeviceHealth { device_id: None } => ApiResponse::ok(&self.health_all().await),
            Command::ListDevices => ApiResponse::ok(&self.devices().await),
            Command::Enroll {
                identity,
                modality,
                sample,
            } => ApiResponse::from_result(self.enroll(&identity, modality, &sample)),
            Command::EnrollFromDevice {
                identity,
                device_id,
            } => ApiResponse::from_result(self.enroll_from_device(&identity, &device_id).await),
            Command::Identify { sample } => ApiResponse::from_result(self.identify(sample)),
            Command::Verify { identity, sample } => {
                ApiResponse::from_result(self.verify(&identity, sample))
            }
            Command::Authenticate {
                identity,
                samples,
                required_matches,
            } => ApiResponse::from_result(self.authenticate(&identity, samples, required_matches)),
            Command::Enrollment { identity } => {
                ApiResponse::from_result(self.enrollment(&identity))
            }
            Command::Anomalies {
                identity,
                device_id,
            } => ApiResponse::ok(&self.anomalies(identity.as_ref(), device_id.as_deref())),
            Command::RecentEvents { limit } => ApiResponse::ok(&self.recent_events(limit)),
            Command::RecognitionStats => ApiResponse::ok(&self.recognition_stats()),
            Command::DeviceStats => ApiResponse::ok(&self.device_stats().await),
            Command::ReviewQueue => ApiResponse::ok(&self.review_queue()),
            Command::Purge { identity } => ApiResponse::from_result(self.purge_identity(&identity)),
        }
    }

    /// Parses and runs one JSON command. Malformed input is a validation error.
    pub async fn dispatch_json(&self, raw: &str) -> ApiResponse {
        match serde_json::from_str::<Command>(raw) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => ApiResponse::error("validation", e.to_string()),
        }
    }
}
