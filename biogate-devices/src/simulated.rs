use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::{DeviceConfig, DeviceKind};
use crate::driver::{ConnectionHandle, DeviceDriver};
use crate::error::DriverError;
use crate::frame::{Frame, Minutia, MinutiaKind, Payload};

pub const FACE_SIZE: u32 = 32;

/// Deterministic face-like luma pattern for `subject`, centered on `brightness`.
pub fn face_pattern(subject: u64, brightness: f32) -> Payload {
    let mut rng = StdRng::seed_from_u64(subject);
    let base = brightness.clamp(0.0, 1.0) * 255.0;
    let luma = (0..FACE_SIZE * FACE_SIZE)
        .map(|_| (base + rng.gen_range(-60.0f32..60.0)).clamp(0.0, 255.0) as u8)
        .collect();
    Payload::Image {
        width: FACE_SIZE,
        height: FACE_SIZE,
        luma,
    }
}

/// Deterministic minutiae set for `subject` on a 256x256 sensor.
pub fn fingerprint_pattern(subject: u64, count: usize) -> Vec<Minutia> {
    let mut rng = StdRng::seed_from_u64(subject ^ 0x5eed_f1e6);
    (0..count)
        .map(|_| {
            let kind = if rng.gen_bool(0.5) {
                MinutiaKind::Ending
            } else {
                MinutiaKind::Bifurcation
            };
            Minutia::new(
                rng.gen_range(0.0..256.0),
                rng.gen_range(0.0..256.0),
                rng.gen_range(0.0..std::f32::consts::TAU),
                kind,
            )
        })
        .collect()
}

pub fn card_code(subject: u64) -> String {
    format!("CARD-{subject:08}")
}

#[derive(Debug, Default)]
struct Faults {
    fail_connects: u32,
    fail_captures: u32,
    hang_captures: bool,
}

struct OpenConnection {
    kind: DeviceKind,
}

struct State {
    open: HashMap<u64, OpenConnection>,
    scripts: HashMap<String, VecDeque<Frame>>,
    subjects: HashMap<String, Vec<u64>>,
    faults: HashMap<String, Faults>,
    rng: StdRng,
}

enum Capture {
    Ready(Frame),
    Fail(String),
    Hang,
}

/// In-process driver producing synthetic or scripted frames, with fault injection.
pub struct SimulatedDriver {
    state: Mutex<State>,
    capture_latency: Duration,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::with_seed(0x0b10_6a7e)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(State {
                open: HashMap::new(),
                scripts: HashMap::new(),
                subjects: HashMap::new(),
                faults: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
            capture_latency: Duration::ZERO,
        }
    }

    pub fn with_capture_latency(mut self, latency: Duration) -> Self {
        self.capture_latency = latency;
        self
    }

    /// Queue frames to be returned, in order, before synthesis resumes.
    pub fn script(&self, device_id: &str, frames: impl IntoIterator<Item = Frame>) {
        self.state
            .lock()
            .scripts
            .entry(device_id.to_string())
            .or_default()
            .extend(frames);
    }

    /// Subjects the device "sees" when synthesizing frames.
    pub fn set_subjects(&self, device_id: &str, subjects: Vec<u64>) {
        self.state
            .lock()
            .subjects
            .insert(device_id.to_string(), subjects);
    }

    pub fn fail_next_connects(&self, device_id: &str, count: u32) {
        self.state
            .lock()
            .faults
            .entry(device_id.to_string())
            .or_default()
            .fail_connects = count;
    }

    pub fn fail_next_captures(&self, device_id: &str, count: u32) {
        self.state
            .lock()
            .faults
            .entry(device_id.to_string())
            .or_default()
            .fail_captures = count;
    }

    /// Make captures on `device_id` block forever (or resume when `false`).
    pub fn hang_captures(&self, device_id: &str, hang: bool) {
        self.state
            .lock()
            .faults
            .entry(device_id.to_string())
            .or_default()
            .hang_captures = hang;
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open.len()
    }

    fn next_capture(&self, handle: &ConnectionHandle) -> Result<Capture, DriverError> {
        let mut state = self.state.lock();
        let kind = match state.open.get(&handle.id) {
            Some(conn) => conn.kind,
            None => return Err(DriverError::Disconnected { handle: handle.id }),
        };

        if let Some(faults) = state.faults.get_mut(&handle.device_id) {
            if faults.hang_captures {
                return Ok(Capture::Hang);
            }
            if faults.fail_captures > 0 {
                faults.fail_captures -= 1;
                return Ok(Capture::Fail("simulated sensor read failure".into()));
            }
        }

        if let Some(mut frame) = state
            .scripts
            .get_mut(&handle.device_id)
            .and_then(|queue| queue.pop_front())
        {
            frame.device_id = handle.device_id.clone();
            return Ok(Capture::Ready(frame));
        }

        let subjects = state
            .subjects
            .get(&handle.device_id)
            .cloned()
            .unwrap_or_default();
        let rng = &mut state.rng;
        let subject = if subjects.is_empty() {
            rng.gen()
        } else {
            subjects[rng.gen_range(0..subjects.len())]
        };
        let quality = rng.gen_range(0.6f32..0.98);
        let frame = match kind {
            DeviceKind::Camera => {
                let brightness = rng.gen_range(0.35f32..0.75);
                Frame::new(
                    handle.device_id.clone(),
                    quality,
                    face_pattern(subject, brightness),
                )
                .with_brightness(brightness)
                .with_angle(rng.gen_range(-15.0..15.0))
            }
            DeviceKind::FingerprintReader => Frame::new(
                handle.device_id.clone(),
                quality,
                Payload::Minutiae {
                    points: fingerprint_pattern(subject, 40),
                },
            ),
            DeviceKind::CardReader => Frame::new(
                handle.device_id.clone(),
                1.0,
                Payload::Card {
                    code: card_code(subject),
                },
            ),
        };
        Ok(Capture::Ready(frame))
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn connect(&self, config: &DeviceConfig) -> Result<ConnectionHandle, DriverError> {
        let mut state = self.state.lock();
        if let Some(faults) = state.faults.get_mut(&config.id) {
            if faults.fail_connects > 0 {
                faults.fail_connects -= 1;
                return Err(DriverError::Connect {
                    endpoint: config.endpoint.clone(),
                    message: "simulated connection refused".into(),
                });
            }
        }
        let handle = ConnectionHandle::allocate(&config.id);
        state
            .open
            .insert(handle.id, OpenConnection { kind: config.kind });
        log::debug!("simulated connect {} -> handle {}", config.id, handle.id);
        Ok(handle)
    }

    async fn capture_frame(&self, handle: &ConnectionHandle) -> Result<Frame, DriverError> {
        let capture = self.next_capture(handle)?;
        if !self.capture_latency.is_zero() {
            tokio::time::sleep(self.capture_latency).await;
        }
        match capture {
            Capture::Ready(frame) => Ok(frame),
            Capture::Fail(message) => Err(DriverError::Capture(message)),
            Capture::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), DriverError> {
        match self.state.lock().open.remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(DriverError::Disconnected { handle: handle.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_are_deterministic_per_subject() {
        assert_eq!(face_pattern(7, 0.5), face_pattern(7, 0.5));
        assert_ne!(face_pattern(7, 0.5), face_pattern(8, 0.5));
        assert_eq!(fingerprint_pattern(3, 20), fingerprint_pattern(3, 20));
    }

    #[tokio::test]
    async fn stale_handle_is_rejected() {
        let driver = SimulatedDriver::new();
        let cfg = DeviceConfig::new("cam-1", DeviceKind::Camera);
        let handle = driver.connect(&cfg).await.unwrap();
        assert!(driver.capture_frame(&handle).await.is_ok());

        driver.disconnect(&handle).await.unwrap();
        let err = driver.capture_frame(&handle).await.unwrap_err();
        assert_eq!(err, DriverError::Disconnected { handle: handle.id });
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn scripted_frames_come_first() {
        let driver = SimulatedDriver::new();
        let cfg = DeviceConfig::new("card-1", DeviceKind::CardReader);
        driver.script(
            "card-1",
            [Frame::new("x", 1.0, Payload::Card { code: "A".into() })],
        );
        let handle = driver.connect(&cfg).await.unwrap();
        let first = driver.capture_frame(&handle).await.unwrap();
        assert_eq!(first.payload, Payload::Card { code: "A".into() });
        assert_eq!(first.device_id, "card-1");
        let second = driver.capture_frame(&handle).await.unwrap();
        assert_ne!(second.payload, first.payload);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let driver = SimulatedDriver::new();
        let cfg = DeviceConfig::new("fp-1", DeviceKind::FingerprintReader);
        driver.fail_next_connects("fp-1", 1);
        assert!(matches!(
            driver.connect(&cfg).await,
            Err(DriverError::Connect { .. })
        ));
        let handle = driver.connect(&cfg).await.unwrap();

        driver.fail_next_captures("fp-1", 1);
        assert!(matches!(
            driver.capture_frame(&handle).await,
            Err(DriverError::Capture(_))
        ));
        assert!(driver.capture_frame(&handle).await.is_ok());
    }
}
