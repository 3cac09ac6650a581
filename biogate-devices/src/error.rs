use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceStatus;

/// Failures reported by a device driver backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("connection handle {handle} is no longer open")]
    Disconnected { handle: u64 },

    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation not supported by driver: {0}")]
    Unsupported(&'static str),
}

impl DriverError {
    /// Errors that mean the connection itself is gone, as opposed to one bad frame.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            DriverError::Connect { .. } | DriverError::Disconnected { .. } | DriverError::Timeout(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device request: {0}")]
    Validation(String),

    #[error("unknown device {0}")]
    NotFound(String),

    #[error("device {0} is already registered")]
    AlreadyRegistered(String),

    #[error("device {0} is deactivated")]
    Deactivated(String),

    #[error("device {device} is {status}, expected {expected}")]
    InvalidState {
        device: String,
        status: DeviceStatus,
        expected: &'static str,
    },

    #[error("device {0} has no buffered frames")]
    NoFrames(String),

    #[error("driver error on device {device}: {source}")]
    Driver {
        device: String,
        #[source]
        source: DriverError,
    },
}

impl DeviceError {
    pub fn driver(device: &str, source: DriverError) -> Self {
        DeviceError::Driver {
            device: device.to_string(),
            source,
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
