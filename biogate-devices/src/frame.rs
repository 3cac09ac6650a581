use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Biometric input channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    Face,
    Fingerprint,
    Card,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Face, Modality::Fingerprint, Modality::Card];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Face => "face",
            Modality::Fingerprint => "fingerprint",
            Modality::Card => "card",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MinutiaKind {
    Ending,
    Bifurcation,
}

/// A single fingerprint feature point, in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Minutia {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub kind: MinutiaKind,
}

impl Minutia {
    pub fn new(x: f32, y: f32, angle: f32, kind: MinutiaKind) -> Self {
        Self { x, y, angle, kind }
    }

    pub fn distance(&self, other: &Minutia) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Raw capture content. Images are 8-bit luma, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    Image {
        width: u32,
        height: u32,
        #[serde(with = "serde_bytes")]
        luma: Vec<u8>,
    },
    Minutiae {
        points: Vec<Minutia>,
    },
    Card {
        code: String,
    },
}

impl Payload {
    pub fn modality(&self) -> Modality {
        match self {
            Payload::Image { .. } => Modality::Face,
            Payload::Minutiae { .. } => Modality::Fingerprint,
            Payload::Card { .. } => Modality::Card,
        }
    }
}

/// Capture-time measurements reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptors {
    pub brightness: Option<f32>,
    pub angle: Option<f32>,
    pub minutiae_count: Option<u32>,
}

/// One immutable capture unit: an image region, a fingerprint scan or a card read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub device_id: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
    pub quality: f32,
    #[serde(default)]
    pub descriptors: Descriptors,
    pub payload: Payload,
}

impl Frame {
    pub fn new(device_id: impl Into<String>, quality: f32, payload: Payload) -> Self {
        let minutiae_count = match &payload {
            Payload::Minutiae { points } => Some(points.len() as u32),
            _ => None,
        };
        Self {
            device_id: device_id.into(),
            sequence: 0,
            captured_at: Utc::now(),
            quality: quality.clamp(0.0, 1.0),
            descriptors: Descriptors {
                minutiae_count,
                ..Descriptors::default()
            },
            payload,
        }
    }

    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.descriptors.brightness = Some(brightness.clamp(0.0, 1.0));
        self
    }

    pub fn with_angle(mut self, angle: f32) -> Self {
        self.descriptors.angle = Some(angle);
        self
    }

    pub fn modality(&self) -> Modality {
        self.payload.modality()
    }

    /// Reported brightness, or mean luma estimated from the image payload.
    pub fn brightness(&self) -> Option<f32> {
        if let Some(b) = self.descriptors.brightness {
            return Some(b);
        }
        match &self.payload {
            Payload::Image { luma, .. } if !luma.is_empty() => {
                let sum: u64 = luma.iter().map(|&p| p as u64).sum();
                Some(sum as f32 / luma.len() as f32 / 255.0)
            }
            _ => None,
        }
    }

    pub fn minutiae_count(&self) -> Option<u32> {
        self.descriptors.minutiae_count.or(match &self.payload {
            Payload::Minutiae { points } => Some(points.len() as u32),
            _ => None,
        })
    }

    pub fn to_gray_image(&self) -> Option<GrayImage> {
        match &self.payload {
            Payload::Image {
                width,
                height,
                luma,
            } => GrayImage::from_raw(*width, *height, luma.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brightness_falls_back_to_mean_luma() {
        let frame = Frame::new(
            "cam-1",
            0.9,
            Payload::Image {
                width: 2,
                height: 1,
                luma: vec![0, 255],
            },
        );
        let b = frame.brightness().unwrap();
        assert!((b - 0.5).abs() < 1e-3);

        let frame = frame.with_brightness(0.8);
        assert_eq!(frame.brightness(), Some(0.8));
    }

    #[test]
    fn minutiae_count_follows_payload() {
        let points = vec![
            Minutia::new(1.0, 2.0, 0.0, MinutiaKind::Ending),
            Minutia::new(5.0, 9.0, 1.0, MinutiaKind::Bifurcation),
        ];
        let frame = Frame::new("fp-1", 0.9, Payload::Minutiae { points });
        assert_eq!(frame.modality(), Modality::Fingerprint);
        assert_eq!(frame.minutiae_count(), Some(2));
    }

    #[test]
    fn gray_image_requires_consistent_dimensions() {
        let frame = Frame::new(
            "cam-1",
            0.9,
            Payload::Image {
                width: 4,
                height: 4,
                luma: vec![0; 3],
            },
        );
        assert!(frame.to_gray_image().is_none());
    }
}
