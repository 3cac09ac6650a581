use biogate_devices::{Frame, Modality, Payload};
use serde::{Deserialize, Deserializer, Serialize};

/// Why a sample is being assessed. Enrollment is stricter than recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    Enrollment,
    Recognition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityThresholds {
    pub min_quality: f32,
    pub min_brightness: Option<f32>,
    pub min_minutiae: Option<u32>,
}

impl Default for ModalityThresholds {
    fn default() -> Self {
        Self {
            min_quality: 0.5,
            min_brightness: None,
            min_minutiae: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    pub face: ModalityThresholds,
    pub fingerprint: ModalityThresholds,
    pub card: ModalityThresholds,
}

impl ThresholdSet {
    pub fn get(&self, modality: Modality) -> &ModalityThresholds {
        match modality {
            Modality::Face => &self.face,
            Modality::Fingerprint => &self.fingerprint,
            Modality::Card => &self.card,
        }
    }

    pub fn enrollment() -> Self {
        Self {
            face: ModalityThresholds {
                min_quality: 0.75,
                min_brightness: Some(0.5),
                min_minutiae: None,
            },
            fingerprint: ModalityThresholds {
                min_quality: 0.85,
                min_brightness: None,
                min_minutiae: Some(8),
            },
            card: ModalityThresholds {
                min_quality: 0.0,
                ..ModalityThresholds::default()
            },
        }
    }

    pub fn recognition() -> Self {
        Self {
            face: ModalityThresholds {
                min_quality: 0.5,
                min_brightness: Some(0.2),
                min_minutiae: None,
            },
            fingerprint: ModalityThresholds {
                min_quality: 0.5,
                min_brightness: None,
                min_minutiae: None,
            },
            card: ModalityThresholds {
                min_quality: 0.0,
                ..ModalityThresholds::default()
            },
        }
    }

    fn overlay(mut self, partial: PartialSet) -> Self {
        self.face.overlay(partial.face);
        self.fingerprint.overlay(partial.fingerprint);
        self.card.overlay(partial.card);
        self
    }
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self::recognition()
    }
}

impl ModalityThresholds {
    fn overlay(&mut self, partial: PartialThresholds) {
        if let Some(q) = partial.min_quality {
            self.min_quality = q;
        }
        if partial.min_brightness.is_some() {
            self.min_brightness = partial.min_brightness;
        }
        if partial.min_minutiae.is_some() {
            self.min_minutiae = partial.min_minutiae;
        }
    }
}

/// Config-file view of a threshold set. Keys left out keep the built-in
/// value for that purpose and modality.
#[derive(Default, Deserialize)]
#[serde(default)]
struct PartialSet {
    face: PartialThresholds,
    fingerprint: PartialThresholds,
    card: PartialThresholds,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct PartialThresholds {
    min_quality: Option<f32>,
    min_brightness: Option<f32>,
    min_minutiae: Option<u32>,
}

fn enrollment_set<'de, D: Deserializer<'de>>(de: D) -> Result<ThresholdSet, D::Error> {
    PartialSet::deserialize(de).map(|p| ThresholdSet::enrollment().overlay(p))
}

fn recognition_set<'de, D: Deserializer<'de>>(de: D) -> Result<ThresholdSet, D::Error> {
    PartialSet::deserialize(de).map(|p| ThresholdSet::recognition().overlay(p))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    #[serde(deserialize_with = "enrollment_set")]
    pub enrollment: ThresholdSet,
    #[serde(deserialize_with = "recognition_set")]
    pub recognition: ThresholdSet,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enrollment: ThresholdSet::enrollment(),
            recognition: ThresholdSet::recognition(),
        }
    }
}

/// Measurements kept alongside every recognition event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub score: f32,
    pub brightness: Option<f32>,
    pub minutiae_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub modality: Modality,
    pub purpose: Purpose,
    pub metrics: QualityMetrics,
    pub passed: bool,
    pub reasons: Vec<String>,
}

impl QualityReport {
    pub(crate) fn reject(&mut self, reason: impl Into<String>) {
        self.passed = false;
        self.reasons.push(reason.into());
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn thresholds(&self, modality: Modality, purpose: Purpose) -> &ModalityThresholds {
        match purpose {
            Purpose::Enrollment => self.config.enrollment.get(modality),
            Purpose::Recognition => self.config.recognition.get(modality),
        }
    }

    pub fn assess(&self, frame: &Frame, purpose: Purpose) -> QualityReport {
        let modality = frame.modality();
        let limits = self.thresholds(modality, purpose);
        let metrics = QualityMetrics {
            score: frame.quality,
            brightness: frame.brightness(),
            minutiae_count: frame.minutiae_count(),
        };
        let mut report = QualityReport {
            modality,
            purpose,
            metrics,
            passed: true,
            reasons: Vec::new(),
        };

        if !(0.0..=1.0).contains(&frame.quality) {
            report.reject(format!("quality {} outside 0..=1", frame.quality));
        } else if frame.quality < limits.min_quality {
            let reason = format!(
                "quality {:.2} below minimum {:.2}",
                frame.quality, limits.min_quality
            );
            report.reject(reason);
        }
        if let Some(b) = report.metrics.brightness.filter(|b| !(0.0..=1.0).contains(b)) {
            report.reject(format!("brightness {b} outside 0..=1"));
        } else if let Some(min) = limits.min_brightness {
            match report.metrics.brightness {
                Some(b) if b >= min => {}
                Some(b) => report.reject(format!("brightness {b:.2} below minimum {min:.2}")),
                None => report.reject("brightness unavailable"),
            }
        }
        if let Some(min) = limits.min_minutiae {
            let count = report.metrics.minutiae_count.unwrap_or(0);
            if count < min {
                report.reject(format!("{count} minutiae, need at least {min}"));
            }
        }
        match &frame.payload {
            Payload::Image { luma, .. } if luma.is_empty() => report.reject("empty image"),
            Payload::Card { code } if code.trim().is_empty() => report.reject("empty card code"),
            _ => {}
        }

        report
    }
}
