use biogate_devices::{Minutia, Modality};
use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::IdentityId;

/// Extracted, comparable representation of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Features {
    Vector(Array1<f32>),
    Minutiae(Vec<Minutia>),
    Card(String),
}

impl Features {
    pub fn modality(&self) -> Modality {
        match self {
            Features::Vector(_) => Modality::Face,
            Features::Minutiae(_) => Modality::Fingerprint,
            Features::Card(_) => Modality::Card,
        }
    }
}

/// Enrolled, versioned biometric reference for one identity and modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub identity: IdentityId,
    pub modality: Modality,
    pub version: u32,
    pub quality: f32,
    pub enrolled_at: DateTime<Utc>,
    /// Store-wide enrollment order, used to break score ties.
    pub sequence: u64,
    pub features: Features,
}
