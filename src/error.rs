use std::path::PathBuf;

use biogate_devices::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unknown {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("template storage at {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template storage at {}: {message}", path.display())]
    StorageFormat { path: PathBuf, message: String },
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable category reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not-found",
            EngineError::Device(DeviceError::Validation(_)) => "validation",
            EngineError::Device(DeviceError::NotFound(_)) => "not-found",
            EngineError::Device(DeviceError::Driver { .. }) => "device-fault",
            EngineError::Device(_) => "device-state",
            EngineError::StorageIo { .. } | EngineError::StorageFormat { .. } => "storage",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
