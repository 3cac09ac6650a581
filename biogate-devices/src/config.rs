use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::BrightnessBand;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub max_drop_rate: f32,
    pub error_warning: u64,
    pub recalibrate_after_hours: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_drop_rate: 0.1,
            error_warning: 5,
            recalibrate_after_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub capture_interval_ms: u64,
    pub buffer_capacity: usize,
    pub driver_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub event_capacity: usize,
    pub auto_calibration_samples: usize,
    pub brightness_band: BrightnessBand,
    pub reconnect: ReconnectPolicy,
    pub health: HealthConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capture_interval_ms: 100,
            buffer_capacity: 30,
            driver_timeout_ms: 10_000,
            max_consecutive_failures: 3,
            event_capacity: 256,
            auto_calibration_samples: 10,
            brightness_band: BrightnessBand::default(),
            reconnect: ReconnectPolicy::default(),
            health: HealthConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms.max(1))
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
    }
}
