pub mod calibration;
mod capture;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod frame;
pub mod health;
pub mod registry;
pub mod simulated;
pub mod stream;
#[cfg(feature = "v4l")]
pub mod video;

// Re-export commonly used types
pub use calibration::{AutoCalibrationReport, Calibration, CalibrationUpdate};
pub use config::RegistryConfig;
pub use device::{Capability, DeviceConfig, DeviceInfo, DeviceKind, DeviceStatus};
pub use driver::{ConnectionHandle, DeviceDriver};
pub use error::{DeviceError, DeviceResult, DriverError};
pub use events::{CapturedSample, DeviceEvent};
pub use frame::{Frame, Minutia, MinutiaKind, Modality, Payload};
pub use health::DeviceHealth;
pub use registry::DeviceRegistry;
pub use simulated::SimulatedDriver;
#[cfg(feature = "v4l")]
pub use video::V4lDriver;
