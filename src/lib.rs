pub mod anomaly;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod extract;
pub mod fusion;
pub mod identity;
pub mod matcher;
pub mod notify;
pub mod pipeline;
pub mod quality;
pub mod stats;
pub mod storage;
pub mod store;
pub mod template;

// Re-export device types for convenience
pub use biogate_devices as devices;
pub use biogate_devices::{DeviceConfig, DeviceKind, Frame, Modality, Payload};

pub use anomaly::{Anomaly, AnomalyKind};
pub use api::{ApiResponse, Command};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{RecognitionEvent, RecognitionOutcome};
pub use fusion::{Decision, FusionPolicy, FusionResult};
pub use identity::IdentityId;
pub use pipeline::{EnrollOutcome, PipelineOutcome, Stage};
pub use template::{Features, Template};
