use std::collections::BTreeMap;

use biogate_devices::Modality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::RecognitionEvent;
use crate::identity::IdentityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    RepeatedFailedAttempts,
    LowQualityEvidence,
    PoorLighting,
    DeviceConcentration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Advisory finding; never blocks authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub identity: Option<IdentityId>,
    pub device_id: Option<String>,
    pub event_id: Option<Uuid>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Failed matches per identity above which attempts are flagged.
    pub max_failed_attempts: usize,
    pub min_evidence_quality: f32,
    pub min_face_brightness: f32,
    pub concentration_window: usize,
    pub concentration_ratio: f32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            min_evidence_quality: 0.7,
            min_face_brightness: 0.5,
            concentration_window: 10,
            concentration_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Rule-based scan over a slice of events, oldest first. The result is
    /// recomputed from scratch on each call.
    pub fn detect(&self, events: &[RecognitionEvent]) -> Vec<Anomaly> {
        let now = Utc::now();
        let mut found = Vec::new();
        let cfg = &self.config;

        let mut failures: BTreeMap<&IdentityId, usize> = BTreeMap::new();
        for e in events.iter().filter(|e| e.is_failed_match()) {
            if let Some(identity) = &e.identity {
                *failures.entry(identity).or_default() += 1;
            }
        }
        for (identity, count) in failures {
            if count > cfg.max_failed_attempts {
                found.push(Anomaly {
                    kind: AnomalyKind::RepeatedFailedAttempts,
                    severity: Severity::Medium,
                    message: format!("{count} failed match attempts for {identity}"),
                    identity: Some(identity.clone()),
                    device_id: None,
                    event_id: None,
                    detected_at: now,
                });
            }
        }

        for e in events {
            if e.verified && e.quality.score < cfg.min_evidence_quality {
                found.push(Anomaly {
                    kind: AnomalyKind::LowQualityEvidence,
                    severity: Severity::Low,
                    message: format!(
                        "accepted {} match at quality {:.2}",
                        e.modality, e.quality.score
                    ),
                    identity: e.identity.clone(),
                    device_id: Some(e.device_id.clone()),
                    event_id: Some(e.id),
                    detected_at: now,
                });
            }
            if e.modality == Modality::Face {
                if let Some(b) = e.quality.brightness.filter(|b| *b < cfg.min_face_brightness) {
                    found.push(Anomaly {
                        kind: AnomalyKind::PoorLighting,
                        severity: Severity::Low,
                        message: format!("face sample brightness {b:.2}"),
                        identity: e.identity.clone(),
                        device_id: Some(e.device_id.clone()),
                        event_id: Some(e.id),
                        detected_at: now,
                    });
                }
            }
        }

        let window = cfg.concentration_window.max(1);
        if events.len() >= window {
            let recent = &events[events.len() - window..];
            let mut per_device: BTreeMap<&str, usize> = BTreeMap::new();
            for e in recent {
                *per_device.entry(e.device_id.as_str()).or_default() += 1;
            }
            if let Some((device, count)) = per_device.into_iter().max_by_key(|(_, c)| *c) {
                let share = count as f32 / window as f32;
                if share > cfg.concentration_ratio {
                    found.push(Anomaly {
                        kind: AnomalyKind::DeviceConcentration,
                        severity: Severity::Medium,
                        message: format!(
                            "{count} of the last {window} events came from {device}"
                        ),
                        identity: None,
                        device_id: Some(device.to_string()),
                        event_id: None,
                        detected_at: now,
                    });
                }
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecognitionOutcome;
    use crate::quality::QualityMetrics;

    fn event(device: &str, outcome: RecognitionOutcome, quality: f32, brightness: f32) -> RecognitionEvent {
        RecognitionEvent {
            id: Uuid::new_v4(),
            identity: Some(IdentityId::new("bob").unwrap()),
            modality: Modality::Face,
            device_id: device.into(),
            confidence: 0.0,
            timestamp: Utc::now(),
            verified: outcome == RecognitionOutcome::Identified,
            outcome,
            quality: QualityMetrics {
                score: quality,
                brightness: Some(brightness),
                minutiae_count: None,
            },
        }
    }

    fn kinds(found: &[Anomaly]) -> Vec<AnomalyKind> {
        found.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn failures_at_limit_are_not_flagged() {
        let detector = AnomalyDetector::default();
        let events: Vec<_> = (0..3)
            .map(|i| event(&format!("cam-{i}"), RecognitionOutcome::Unidentified, 0.9, 0.6))
            .collect();
        assert!(detector.detect(&events).is_empty());
    }

    #[test]
    fn lighting_and_evidence_are_independent() {
        let detector = AnomalyDetector::default();
        let found = detector.detect(&[event("cam-1", RecognitionOutcome::Identified, 0.6, 0.3)]);
        assert_eq!(
            kinds(&found),
            vec![AnomalyKind::LowQualityEvidence, AnomalyKind::PoorLighting]
        );

        // a rejected low-quality sample is not accepted evidence
        let found = detector.detect(&[event("cam-1", RecognitionOutcome::LowQuality, 0.3, 0.6)]);
        assert!(found.is_empty());
    }

    #[test]
    fn concentration_needs_a_full_window() {
        let detector = AnomalyDetector::default();
        let mut events: Vec<_> = (0..9)
            .map(|_| event("cam-1", RecognitionOutcome::LowQuality, 0.9, 0.6))
            .collect();
        assert!(detector.detect(&events).is_empty());

        events.push(event("cam-2", RecognitionOutcome::LowQuality, 0.9, 0.6));
        let found = detector.detect(&events);
        assert_eq!(kinds(&found), vec![AnomalyKind::DeviceConcentration]);
        assert_eq!(found[0].device_id.as_deref(), Some("cam-1"));
    }

    #[test]
    fn spread_traffic_is_not_concentrated() {
        let detector = AnomalyDetector::default();
        let events: Vec<_> = (0..10)
            .map(|i| event(&format!("cam-{}", i % 2), RecognitionOutcome::LowQuality, 0.9, 0.6))
            .collect();
        assert!(detector.detect(&events).is_empty());
    }
}
