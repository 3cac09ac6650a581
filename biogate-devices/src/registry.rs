//! Device registry and connection manager.
//!
//! The device table sits behind a `parking_lot` lock that is only held long
//! enough to find a slot. Each slot carries its own async mutex, so every
//! state transition of one device is serialized while different devices never
//! contend with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::calibration::{self, AutoCalibrationReport, Calibration, CalibrationUpdate};
use crate::capture::{self, CaptureTask};
use crate::config::RegistryConfig;
use crate::device::{DeviceConfig, DeviceInfo, DeviceStatus};
use crate::driver::{with_timeout, ConnectionHandle, DeviceDriver};
use crate::error::{DeviceError, DeviceResult, DriverError};
use crate::events::{CapturedSample, DeviceEvent};
use crate::frame::Frame;
use crate::health::{self, DeviceHealth};
use crate::stream::Stream;

pub(crate) struct DeviceSlot {
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) state: Mutex<DeviceState>,
}

pub(crate) struct DeviceState {
    pub(crate) config: DeviceConfig,
    pub(crate) status: DeviceStatus,
    pub(crate) active: bool,
    pub(crate) error_count: u64,
    pub(crate) last_error: Option<String>,
    pub(crate) calibration: Calibration,
    pub(crate) calibrated_at: Option<chrono::DateTime<Utc>>,
    pub(crate) connected_at: Option<chrono::DateTime<Utc>>,
    pub(crate) registered_at: chrono::DateTime<Utc>,
    pub(crate) handle: Option<ConnectionHandle>,
    pub(crate) stream: Option<Stream>,
    pub(crate) capture: Option<CaptureTask>,
}

impl DeviceState {
    fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            status: DeviceStatus::Offline,
            active: true,
            error_count: 0,
            last_error: None,
            calibration: Calibration::default(),
            calibrated_at: None,
            connected_at: None,
            registered_at: Utc::now(),
            handle: None,
            stream: None,
            capture: None,
        }
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        DeviceInfo {
            config: self.config.clone(),
            status: self.status,
            active: self.active,
            streaming: self.stream.as_ref().map_or(false, Stream::is_streaming),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            calibration: self.calibration,
            calibrated_at: self.calibrated_at,
            connected_at: self.connected_at,
            registered_at: self.registered_at,
        }
    }

    pub(crate) fn note_error(&mut self, err: &DriverError) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
    }

    /// Drops the connection after a driver fault, leaving the device in `Error`.
    pub(crate) fn fault(&mut self) -> Option<ConnectionHandle> {
        self.status = DeviceStatus::Error;
        self.stream = None;
        self.connected_at = None;
        self.handle.take()
    }

    fn require_online(&self) -> DeviceResult<&ConnectionHandle> {
        match (&self.status, &self.handle) {
            (DeviceStatus::Online, Some(handle)) => Ok(handle),
            _ => Err(DeviceError::InvalidState {
                device: self.config.id.clone(),
                status: self.status,
                expected: "online",
            }),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: RegistryConfig,
    events: broadcast::Sender<DeviceEvent>,
    sink: RwLock<Option<mpsc::Sender<CapturedSample>>>,
    next_task: AtomicU64,
}

impl Shared {
    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Buffers a captured frame and forwards it to recognition if the device asks for it.
    /// Frames from a handle that is no longer current are discarded.
    pub(crate) fn record_frame(
        &self,
        state: &mut DeviceState,
        handle: &ConnectionHandle,
        frame: Frame,
    ) -> Option<Frame> {
        if state.handle.as_ref() != Some(handle) {
            return None;
        }
        let forwards = state.config.forwards_samples();
        let stream = state.stream.as_mut()?;
        let frame = stream.record(frame);

        if forwards {
            if let Some(sink) = self.sink.read().as_ref() {
                let sample = CapturedSample {
                    device_id: state.config.id.clone(),
                    frame: frame.clone(),
                };
                match sink.try_send(sample) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("sample queue full, dropping frame from {}", state.config.id);
                        stream.record_drop();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::warn!("sample queue closed, frame from {} not forwarded", state.config.id);
                    }
                }
            }
        }
        Some(frame)
    }

    /// Opens a driver connection and allocates a fresh stream. Any handle
    /// still held is closed first.
    pub(crate) async fn open(
        &self,
        driver: &dyn DeviceDriver,
        state: &mut DeviceState,
    ) -> DeviceResult<()> {
        if let Some(stale) = state.handle.take() {
            if let Err(err) = with_timeout(self.config.driver_timeout(), driver.disconnect(&stale)).await {
                log::debug!("device {} stale handle close: {}", state.config.id, err);
            }
        }
        state.status = DeviceStatus::Connecting;
        let result = with_timeout(self.config.driver_timeout(), driver.connect(&state.config)).await;
        match result {
            Ok(handle) => {
                state.handle = Some(handle);
                state.stream = Some(Stream::new(self.config.buffer_capacity));
                state.status = DeviceStatus::Online;
                state.connected_at = Some(Utc::now());
                log::info!("device {} online", state.config.id);
                self.emit(DeviceEvent::Connected {
                    device_id: state.config.id.clone(),
                });
                Ok(())
            }
            Err(err) => {
                state.note_error(&err);
                state.fault();
                log::warn!("device {} failed to connect: {}", state.config.id, err);
                self.emit(DeviceEvent::Fault {
                    device_id: state.config.id.clone(),
                    error: err.to_string(),
                    error_count: state.error_count,
                    fatal: true,
                });
                Err(DeviceError::driver(&state.config.id, err))
            }
        }
    }
}

/// Registry of capture devices and their connections. Cheap to clone.
#[derive(Clone)]
pub struct DeviceRegistry {
    shared: Arc<Shared>,
    default_driver: Arc<dyn DeviceDriver>,
    devices: Arc<RwLock<HashMap<String, Arc<DeviceSlot>>>>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig, default_driver: Arc<dyn DeviceDriver>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                events,
                sink: RwLock::new(None),
                next_task: AtomicU64::new(1),
            }),
            default_driver,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Route frames from recognition-capable devices into `sink`.
    pub fn set_sample_sink(&self, sink: mpsc::Sender<CapturedSample>) {
        *self.shared.sink.write() = Some(sink);
    }

    pub fn register(&self, config: DeviceConfig) -> DeviceResult<DeviceInfo> {
        self.register_with_driver(config, Arc::clone(&self.default_driver))
    }

    pub fn register_with_driver(
        &self,
        config: DeviceConfig,
        driver: Arc<dyn DeviceDriver>,
    ) -> DeviceResult<DeviceInfo> {
        if config.id.trim().is_empty() {
            return Err(DeviceError::Validation("device id must not be empty".into()));
        }
        let id = config.id.clone();
        let state = DeviceState::new(config);
        let info = state.info();
        {
            let mut devices = self.devices.write();
            if devices.contains_key(&id) {
                return Err(DeviceError::AlreadyRegistered(id));
            }
            devices.insert(
                id.clone(),
                Arc::new(DeviceSlot {
                    driver,
                    state: Mutex::new(state),
                }),
            );
        }
        log::info!("registered {:?} device {}", info.config.kind, id);
        self.shared.emit(DeviceEvent::Registered { device_id: id });
        Ok(info)
    }

    fn slot(&self, device_id: &str) -> DeviceResult<Arc<DeviceSlot>> {
        self.devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))
    }

    fn slots(&self) -> Vec<Arc<DeviceSlot>> {
        self.devices.read().values().cloned().collect()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.read().contains_key(device_id)
    }

    pub async fn info(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        let slot = self.slot(device_id)?;
        let state = slot.state.lock().await;
        Ok(state.info())
    }

    pub async fn list(&self) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        for slot in self.slots() {
            out.push(slot.state.lock().await.info());
        }
        out.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        out
    }

    pub async fn connect(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        let slot = self.slot(device_id)?;
        let lingering = {
            let mut state = slot.state.lock().await;
            Self::check_connectable(&state)?;
            let task = state.capture.take();
            if let Some(task) = &task {
                task.signal();
            }
            task
        };
        // a faulted loop may still be backing off before its own reconnect
        if let Some(task) = lingering {
            log::debug!("device {} stopping faulted capture loop", device_id);
            task.stop().await;
        }

        let mut state = slot.state.lock().await;
        Self::check_connectable(&state)?;
        self.shared.open(slot.driver.as_ref(), &mut state).await?;
        Ok(state.info())
    }

    fn check_connectable(state: &DeviceState) -> DeviceResult<()> {
        if !state.active {
            return Err(DeviceError::Deactivated(state.config.id.clone()));
        }
        if matches!(state.status, DeviceStatus::Online | DeviceStatus::Connecting) {
            return Err(DeviceError::InvalidState {
                device: state.config.id.clone(),
                status: state.status,
                expected: "offline",
            });
        }
        Ok(())
    }

    /// Stops capture, closes the driver connection and destroys the stream.
    /// Disconnecting an offline device is a no-op.
    pub async fn disconnect(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        let slot = self.slot(device_id)?;
        self.stop_slot(&slot).await;

        let mut state = slot.state.lock().await;
        if let Some(handle) = state.handle.take() {
            let limit = self.shared.config.driver_timeout();
            if let Err(err) = with_timeout(limit, slot.driver.disconnect(&handle)).await {
                log::warn!("device {} disconnect reported: {}", device_id, err);
                state.note_error(&err);
            }
            log::info!("device {} offline", device_id);
            self.shared.emit(DeviceEvent::Disconnected {
                device_id: device_id.to_string(),
            });
        }
        state.stream = None;
        state.connected_at = None;
        state.status = DeviceStatus::Offline;
        Ok(state.info())
    }

    /// Disconnects the device and marks it inactive. Devices are never removed.
    pub async fn deactivate(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        self.disconnect(device_id).await?;
        let slot = self.slot(device_id)?;
        let mut state = slot.state.lock().await;
        state.active = false;
        self.shared.emit(DeviceEvent::Deactivated {
            device_id: device_id.to_string(),
        });
        Ok(state.info())
    }

    pub async fn start_capture(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        let slot = self.slot(device_id)?;
        let mut state = slot.state.lock().await;
        let handle = state.require_online()?.clone();
        if state.capture.as_ref().is_some_and(CaptureTask::is_finished) {
            state.capture = None;
        }
        if state.capture.is_none() {
            state.capture = Some(capture::spawn(
                Arc::clone(&self.shared),
                Arc::clone(&slot),
                handle,
            ));
            if let Some(stream) = state.stream.as_mut() {
                stream.set_streaming(true);
            }
            log::info!("device {} capture started", device_id);
            self.shared.emit(DeviceEvent::CaptureStarted {
                device_id: device_id.to_string(),
            });
        }
        Ok(state.info())
    }

    /// Stops the capture loop. When this returns the loop task has exited and
    /// will not deliver any further frame.
    pub async fn stop_capture(&self, device_id: &str) -> DeviceResult<DeviceInfo> {
        let slot = self.slot(device_id)?;
        self.stop_slot(&slot).await;
        let state = slot.state.lock().await;
        Ok(state.info())
    }

    async fn stop_slot(&self, slot: &Arc<DeviceSlot>) {
        let task = slot.state.lock().await.capture.take();
        let Some(task) = task else {
            return;
        };
        task.stop().await;

        let mut state = slot.state.lock().await;
        if let Some(stream) = state.stream.as_mut() {
            stream.set_streaming(false);
        }
        log::info!("device {} capture stopped", state.config.id);
        self.shared.emit(DeviceEvent::CaptureStopped {
            device_id: state.config.id.clone(),
        });
    }

    /// Captures a single frame outside the capture loop.
    pub async fn capture_frame(&self, device_id: &str) -> DeviceResult<Frame> {
        let slot = self.slot(device_id)?;
        let mut state = slot.state.lock().await;
        let handle = state.require_online()?.clone();
        let limit = self.shared.config.driver_timeout();
        match with_timeout(limit, slot.driver.capture_frame(&handle)).await {
            Ok(frame) => self
                .shared
                .record_frame(&mut state, &handle, frame)
                .ok_or_else(|| DeviceError::InvalidState {
                    device: device_id.to_string(),
                    status: state.status,
                    expected: "online",
                }),
            Err(err) => {
                state.note_error(&err);
                let fatal = err.is_connection_fault();
                if fatal {
                    if let Some(task) = state.capture.take() {
                        task.cancel();
                    }
                    if let Some(stale) = state.fault() {
                        let _ = with_timeout(limit, slot.driver.disconnect(&stale)).await;
                    }
                } else if let Some(stream) = state.stream.as_mut() {
                    stream.record_drop();
                }
                self.shared.emit(DeviceEvent::Fault {
                    device_id: device_id.to_string(),
                    error: err.to_string(),
                    error_count: state.error_count,
                    fatal,
                });
                Err(DeviceError::driver(device_id, err))
            }
        }
    }

    /// Most recent `limit` buffered frames, oldest first.
    pub async fn frames(&self, device_id: &str, limit: usize) -> DeviceResult<Vec<Frame>> {
        let slot = self.slot(device_id)?;
        let state = slot.state.lock().await;
        Ok(state
            .stream
            .as_ref()
            .map(|s| s.buffer().latest(limit).cloned().collect())
            .unwrap_or_default())
    }

    pub async fn calibrate(
        &self,
        device_id: &str,
        update: &CalibrationUpdate,
    ) -> DeviceResult<Calibration> {
        let slot = self.slot(device_id)?;
        let mut state = slot.state.lock().await;
        if !state.active {
            return Err(DeviceError::Deactivated(device_id.to_string()));
        }
        let next = state.calibration.apply(update);
        self.apply_calibration(&slot, &mut state, next).await?;
        Ok(next)
    }

    pub async fn auto_calibrate(&self, device_id: &str) -> DeviceResult<AutoCalibrationReport> {
        let slot = self.slot(device_id)?;
        let mut state = slot.state.lock().await;
        let samples = self.shared.config.auto_calibration_samples;
        let report = state
            .stream
            .as_ref()
            .and_then(|s| {
                calibration::auto_calibrate(
                    state.calibration,
                    s.buffer().latest(samples),
                    self.shared.config.brightness_band,
                )
            })
            .ok_or_else(|| DeviceError::NoFrames(device_id.to_string()))?;
        self.apply_calibration(&slot, &mut state, report.applied)
            .await?;
        log::info!(
            "device {} auto-calibrated from {} frames (mean brightness {:.2}, adjusted: {})",
            device_id,
            report.samples,
            report.average_brightness,
            report.adjusted
        );
        Ok(report)
    }

    async fn apply_calibration(
        &self,
        slot: &DeviceSlot,
        state: &mut DeviceState,
        next: Calibration,
    ) -> DeviceResult<()> {
        if let Some(handle) = state.handle.clone() {
            let limit = self.shared.config.driver_timeout();
            if let Err(err) = with_timeout(limit, slot.driver.apply_calibration(&handle, &next)).await {
                state.note_error(&err);
                self.shared.emit(DeviceEvent::Fault {
                    device_id: state.config.id.clone(),
                    error: err.to_string(),
                    error_count: state.error_count,
                    fatal: false,
                });
                return Err(DeviceError::driver(&state.config.id, err));
            }
        }
        state.calibration = next;
        state.calibrated_at = Some(Utc::now());
        self.shared.emit(DeviceEvent::Calibrated {
            device_id: state.config.id.clone(),
            calibration: next,
        });
        Ok(())
    }

    pub async fn health(&self, device_id: &str) -> DeviceResult<DeviceHealth> {
        let slot = self.slot(device_id)?;
        let state = slot.state.lock().await;
        let report = health::assess(
            &state.info(),
            state.stream.as_ref(),
            &self.shared.config.health,
            Utc::now(),
        );
        self.shared.emit(DeviceEvent::Health(report.clone()));
        Ok(report)
    }

    pub async fn health_all(&self) -> Vec<DeviceHealth> {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(h) = self.health(&id).await {
                out.push(h);
            }
        }
        out
    }

    /// Disconnects every device; used on service shutdown.
    pub async fn shutdown(&self) {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Err(err) = self.disconnect(&id).await {
                log::warn!("shutdown: {}", err);
            }
        }
    }
}
