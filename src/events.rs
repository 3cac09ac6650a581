use biogate_devices::stream::RingBuffer;
use biogate_devices::{Frame, Modality};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::anomaly::Anomaly;
use crate::identity::IdentityId;
use crate::quality::QualityMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecognitionOutcome {
    Identified,
    Unidentified,
    LowQuality,
}

/// Immutable record of one recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub id: Uuid,
    /// Matched identity, or the claimed one for failed verifications.
    pub identity: Option<IdentityId>,
    pub modality: Modality,
    pub device_id: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub verified: bool,
    pub outcome: RecognitionOutcome,
    pub quality: QualityMetrics,
}

impl RecognitionEvent {
    pub fn is_failed_match(&self) -> bool {
        self.outcome == RecognitionOutcome::Unidentified
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub max_events: usize,
    pub channel_capacity: usize,
    pub sample_queue: usize,
    pub review_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            channel_capacity: 256,
            sample_queue: 64,
            review_capacity: 100,
        }
    }
}

/// Bounded, append-only recognition history. Oldest events are discarded
/// once `max_events` is reached.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<RingBuffer<RecognitionEvent>>,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(RingBuffer::new(max_events)),
        }
    }

    pub fn append(&self, event: RecognitionEvent) {
        self.events.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.lock().capacity()
    }

    pub fn snapshot(&self) -> Vec<RecognitionEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Up to `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<RecognitionEvent> {
        self.events.lock().latest(n).cloned().collect()
    }

    pub fn for_identity(&self, identity: &IdentityId) -> Vec<RecognitionEvent> {
        self.filtered(|e| e.identity.as_ref() == Some(identity))
    }

    pub fn for_device(&self, device_id: &str) -> Vec<RecognitionEvent> {
        self.filtered(|e| e.device_id == device_id)
    }

    fn filtered(&self, keep: impl Fn(&RecognitionEvent) -> bool) -> Vec<RecognitionEvent> {
        self.events.lock().iter().filter(|e| keep(e)).cloned().collect()
    }
}

/// Sample that could not be identified, kept for manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub event_id: Uuid,
    pub device_id: String,
    pub modality: Modality,
    pub best_score: Option<f32>,
    pub frame: Frame,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ReviewQueue {
    items: Mutex<RingBuffer<ReviewItem>>,
}

impl ReviewQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    /// Returns the item evicted to make room, if any.
    pub fn push(&self, item: ReviewItem) -> Option<ReviewItem> {
        self.items.lock().push(item)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn list(&self) -> Vec<ReviewItem> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<ReviewItem> {
        let mut items = self.items.lock();
        let drained = items.iter().cloned().collect();
        items.clear();
        drained
    }
}

/// Fan-out channels for recognition and anomaly notifications. Device events
/// are published by the registry on its own channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    recognition: broadcast::Sender<RecognitionEvent>,
    anomalies: broadcast::Sender<Anomaly>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recognition: broadcast::channel(capacity).0,
            anomalies: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_recognition(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.recognition.subscribe()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Anomaly> {
        self.anomalies.subscribe()
    }

    pub fn publish_recognition(&self, event: RecognitionEvent) {
        // no subscribers is fine
        let _ = self.recognition.send(event);
    }

    pub fn publish_anomaly(&self, anomaly: Anomaly) {
        let _ = self.anomalies.send(anomaly);
    }
}
