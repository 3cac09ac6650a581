use biogate_devices::{Frame, Payload};
use image::imageops::{self, FilterType};
use ndarray::Array1;

use crate::template::Features;

/// Turns a raw sample into comparable features. A trained model plugs in here.
pub trait Extractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> Option<Features>;
}

/// Deterministic stand-in: a downscaled, mean-centered, L2-normalized luma
/// vector for faces; minutiae and card codes pass through.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderExtractor {
    width: u32,
    height: u32,
}

impl Default for PlaceholderExtractor {
    fn default() -> Self {
        Self {
            width: 16,
            height: 8,
        }
    }
}

impl PlaceholderExtractor {
    pub fn dims(&self) -> usize {
        (self.width * self.height) as usize
    }

    fn embed(&self, frame: &Frame) -> Option<Array1<f32>> {
        let gray = frame.to_gray_image()?;
        if gray.width() == 0 || gray.height() == 0 {
            return None;
        }
        let small = imageops::resize(&gray, self.width, self.height, FilterType::Triangle);
        let mut v = Array1::from_iter(small.pixels().map(|p| p.0[0] as f32 / 255.0));
        let mean = v.mean()?;
        v -= mean;
        let norm = v.dot(&v).sqrt();
        if norm > f32::EPSILON {
            v /= norm;
        }
        Some(v)
    }
}

impl Extractor for PlaceholderExtractor {
    fn extract(&self, frame: &Frame) -> Option<Features> {
        match &frame.payload {
            Payload::Image { .. } => self.embed(frame).map(Features::Vector),
            Payload::Minutiae { points } if !points.is_empty() => {
                Some(Features::Minutiae(points.clone()))
            }
            Payload::Minutiae { .. } => None,
            Payload::Card { code } => {
                let code = code.trim();
                (!code.is_empty()).then(|| Features::Card(code.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biogate_devices::simulated::face_pattern;

    #[test]
    fn face_vectors_are_unit_length() {
        let extractor = PlaceholderExtractor::default();
        let frame = Frame::new("cam-1", 0.9, face_pattern(3, 0.5));
        let Some(Features::Vector(v)) = extractor.extract(&frame) else {
            panic!("expected a vector");
        };
        assert_eq!(v.len(), extractor.dims());
        assert!((v.dot(&v).sqrt() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn flat_image_yields_zero_vector() {
        let extractor = PlaceholderExtractor::default();
        let frame = Frame::new(
            "cam-1",
            0.9,
            Payload::Image {
                width: 4,
                height: 4,
                luma: vec![128; 16],
            },
        );
        let Some(Features::Vector(v)) = extractor.extract(&frame) else {
            panic!("expected a vector");
        };
        assert!(v.iter().all(|x| x.abs() < 1e-6));
    }

    #[test]
    fn malformed_inputs_yield_nothing() {
        let extractor = PlaceholderExtractor::default();
        let broken = Frame::new(
            "cam-1",
            0.9,
            Payload::Image {
                width: 8,
                height: 8,
                luma: vec![1; 3],
            },
        );
        assert!(extractor.extract(&broken).is_none());
        let blank = Frame::new("door", 1.0, Payload::Card { code: " ".into() });
        assert!(extractor.extract(&blank).is_none());
    }
}
