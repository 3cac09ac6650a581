use biogate_devices::DeviceEvent;
use log::{info, warn};
use serde::Serialize;

use crate::anomaly::Anomaly;
use crate::events::{RecognitionEvent, RecognitionOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    Recognition(RecognitionEvent),
    Anomaly(Anomaly),
    Device(DeviceEvent),
}

/// Receives everything published on the engine's channels.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Recognition(e) => match e.outcome {
                RecognitionOutcome::Identified => info!(
                    "✓ {} identified as {} on {} ({:.3})",
                    e.modality,
                    e.identity.as_ref().map(|i| i.as_str()).unwrap_or("?"),
                    e.device_id,
                    e.confidence
                ),
                RecognitionOutcome::Unidentified => {
                    info!("{} sample on {} not identified", e.modality, e.device_id)
                }
                RecognitionOutcome::LowQuality => log::debug!(
                    "{} sample on {} rejected at quality {:.2}",
                    e.modality,
                    e.device_id,
                    e.quality.score
                ),
            },
            Notification::Anomaly(a) => warn!("anomaly {:?}: {}", a.kind, a.message),
            Notification::Device(DeviceEvent::Fault {
                device_id, error, ..
            }) => warn!("device {} fault: {}", device_id, error),
            Notification::Device(e) => info!("device {}: {:?}", e.device_id(), e),
        }
    }
}
