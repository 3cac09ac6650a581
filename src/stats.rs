use std::collections::BTreeMap;

use biogate_devices::{DeviceInfo, DeviceKind, DeviceStatus, Modality};
use serde::Serialize;

use crate::events::{RecognitionEvent, RecognitionOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub identified: usize,
    pub unidentified: usize,
    pub low_quality: usize,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: RecognitionOutcome) {
        self.total += 1;
        match outcome {
            RecognitionOutcome::Identified => self.identified += 1,
            RecognitionOutcome::Unidentified => self.unidentified += 1,
            RecognitionOutcome::LowQuality => self.low_quality += 1,
        }
    }

    /// Identified over all attempts, 0 when there were none.
    pub fn success_rate(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.identified as f32 / self.total as f32
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognitionStats {
    pub outcomes: OutcomeCounts,
    pub success_rate: f32,
    /// Mean confidence of identified events.
    pub mean_confidence: f32,
    pub mean_quality: f32,
    pub per_modality: BTreeMap<Modality, OutcomeCounts>,
    pub per_device: BTreeMap<String, OutcomeCounts>,
}

impl RecognitionStats {
    pub fn from_events(events: &[RecognitionEvent]) -> Self {
        let mut stats = Self::default();
        let mut confidence_sum = 0.0f32;
        let mut quality_sum = 0.0f32;
        for e in events {
            stats.outcomes.add(e.outcome);
            stats.per_modality.entry(e.modality).or_default().add(e.outcome);
            stats
                .per_device
                .entry(e.device_id.clone())
                .or_default()
                .add(e.outcome);
            if e.outcome == RecognitionOutcome::Identified {
                confidence_sum += e.confidence;
            }
            quality_sum += e.quality.score;
        }
        stats.success_rate = stats.outcomes.success_rate();
        if stats.outcomes.identified > 0 {
            stats.mean_confidence = confidence_sum / stats.outcomes.identified as f32;
        }
        if !events.is_empty() {
            stats.mean_quality = quality_sum / events.len() as f32;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStats {
    pub total: usize,
    pub active: usize,
    pub online: usize,
    pub offline: usize,
    pub connecting: usize,
    pub error: usize,
    pub streaming: usize,
    pub total_errors: u64,
    pub per_kind: BTreeMap<String, usize>,
}

impl DeviceStats {
    pub fn from_devices(devices: &[DeviceInfo]) -> Self {
        let mut stats = Self::default();
        for d in devices {
            stats.total += 1;
            if d.active {
                stats.active += 1;
            }
            match d.status {
                DeviceStatus::Online => stats.online += 1,
                DeviceStatus::Offline => stats.offline += 1,
                DeviceStatus::Connecting => stats.connecting += 1,
                DeviceStatus::Error => stats.error += 1,
            }
            if d.streaming {
                stats.streaming += 1;
            }
            stats.total_errors += d.error_count;
            *stats.per_kind.entry(kind_name(d.config.kind).into()).or_default() += 1;
        }
        stats
    }
}

fn kind_name(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Camera => "camera",
        DeviceKind::FingerprintReader => "fingerprint-reader",
        DeviceKind::CardReader => "card-reader",
    }
}
