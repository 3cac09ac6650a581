use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::device::{DeviceInfo, DeviceStatus};
use crate::stream::Stream;

pub const CHECK_CONNECTION: &str = "check connection";
pub const REDUCE_CAPTURE_RATE: &str = "reduce capture rate or check bandwidth";
pub const INSPECT_DRIVER: &str = "inspect driver and cabling";
pub const RECALIBRATE: &str = "recalibrate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub status: DeviceStatus,
    pub active: bool,
    pub streaming: bool,
    pub uptime_secs: Option<i64>,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub drop_rate: f32,
    pub buffered_frames: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub calibrated: bool,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl DeviceHealth {
    pub fn is_healthy(&self) -> bool {
        self.recommendations.is_empty()
    }
}

pub fn assess(
    info: &DeviceInfo,
    stream: Option<&Stream>,
    cfg: &HealthConfig,
    now: DateTime<Utc>,
) -> DeviceHealth {
    let (frames_captured, frames_dropped, drop_rate, buffered_frames) = match stream {
        Some(s) => (s.frames_captured, s.frames_dropped, s.drop_rate(), s.buffer().len()),
        None => (0, 0, 0.0, 0),
    };

    let uptime_secs = match (info.status, info.connected_at) {
        (DeviceStatus::Online, Some(at)) => Some((now - at).num_seconds().max(0)),
        _ => None,
    };

    let mut recommendations = Vec::new();
    if info.active && matches!(info.status, DeviceStatus::Offline | DeviceStatus::Error) {
        recommendations.push(CHECK_CONNECTION.to_string());
    }
    if drop_rate > cfg.max_drop_rate {
        recommendations.push(REDUCE_CAPTURE_RATE.to_string());
    }
    if info.error_count >= cfg.error_warning {
        recommendations.push(INSPECT_DRIVER.to_string());
    }
    let stale_after = Duration::hours(cfg.recalibrate_after_hours);
    match info.calibrated_at {
        None => recommendations.push(RECALIBRATE.to_string()),
        Some(at) if now - at > stale_after => recommendations.push(RECALIBRATE.to_string()),
        Some(_) => {}
    }

    DeviceHealth {
        device_id: info.config.id.clone(),
        status: info.status,
        active: info.active,
        streaming: info.streaming,
        uptime_secs,
        frames_captured,
        frames_dropped,
        drop_rate,
        buffered_frames,
        error_count: info.error_count,
        last_error: info.last_error.clone(),
        calibrated: info.calibrated_at.is_some(),
        recommendations,
        checked_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::device::{DeviceConfig, DeviceKind};
    use crate::frame::{Frame, Payload};

    fn info(status: DeviceStatus) -> DeviceInfo {
        let now = Utc::now();
        DeviceInfo {
            config: DeviceConfig::new("cam-1", DeviceKind::Camera),
            status,
            active: true,
            streaming: false,
            error_count: 0,
            last_error: None,
            calibration: Calibration::default(),
            calibrated_at: Some(now),
            connected_at: Some(now - Duration::seconds(30)),
            registered_at: now,
        }
    }

    #[test]
    fn healthy_online_device_has_no_recommendations() {
        let now = Utc::now();
        let health = assess(&info(DeviceStatus::Online), None, &HealthConfig::default(), now);
        assert!(health.is_healthy(), "{:?}", health.recommendations);
        assert!(health.uptime_secs.unwrap() >= 30);
    }

    #[test]
    fn offline_uncalibrated_device_gets_advice() {
        let mut i = info(DeviceStatus::Error);
        i.calibrated_at = None;
        i.error_count = 7;
        let health = assess(&i, None, &HealthConfig::default(), Utc::now());
        assert_eq!(health.uptime_secs, None);
        assert!(health.recommendations.contains(&CHECK_CONNECTION.to_string()));
        assert!(health.recommendations.contains(&INSPECT_DRIVER.to_string()));
        assert!(health.recommendations.contains(&RECALIBRATE.to_string()));
    }

    #[test]
    fn high_drop_rate_is_flagged() {
        let mut stream = Stream::new(4);
        stream.record(Frame::new("cam-1", 1.0, Payload::Card { code: "x".into() }));
        stream.record_drop();
        let health = assess(
            &info(DeviceStatus::Online),
            Some(&stream),
            &HealthConfig::default(),
            Utc::now(),
        );
        assert_eq!(health.frames_dropped, 1);
        assert!(health.recommendations.contains(&REDUCE_CAPTURE_RATE.to_string()));
    }

    #[test]
    fn old_calibration_is_stale() {
        let now = Utc::now();
        let mut i = info(DeviceStatus::Online);
        i.calibrated_at = Some(now - Duration::hours(200));
        let health = assess(&i, None, &HealthConfig::default(), now);
        assert_eq!(health.recommendations, vec![RECALIBRATE.to_string()]);
    }
}
