//! Driver seam between the registry and capture hardware.
//!
//! Anything that can open a device, hand back frames and close it again can
//! back a registered device: a camera SDK, a replay harness or the
//! [`SimulatedDriver`](crate::simulated::SimulatedDriver).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::device::DeviceConfig;
use crate::error::DriverError;
use crate::frame::Frame;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Token for one open driver connection. Handles are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub device_id: String,
    pub id: u64,
}

impl ConnectionHandle {
    pub fn allocate(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn connect(&self, config: &DeviceConfig) -> Result<ConnectionHandle, DriverError>;

    async fn capture_frame(&self, handle: &ConnectionHandle) -> Result<Frame, DriverError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), DriverError>;

    async fn apply_calibration(
        &self,
        _handle: &ConnectionHandle,
        _calibration: &Calibration,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Runs a driver call under `limit`; expiry becomes [`DriverError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}
