use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use biogate_devices::calibration::CalibrationUpdate;
use biogate_devices::config::ReconnectPolicy;
use biogate_devices::{
    ConnectionHandle, DeviceConfig, DeviceDriver, DeviceError, DeviceEvent, DeviceKind,
    DeviceRegistry, DeviceStatus, DriverError, Frame, Payload, RegistryConfig, SimulatedDriver,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Wraps the simulator and remembers every handle it gave out.
struct RecordingDriver {
    inner: SimulatedDriver,
    handles: Mutex<Vec<ConnectionHandle>>,
}

impl RecordingDriver {
    fn new() -> Self {
        Self {
            inner: SimulatedDriver::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn last_handle(&self) -> ConnectionHandle {
        self.handles.lock().last().cloned().expect("no handle issued")
    }
}

#[async_trait]
impl DeviceDriver for RecordingDriver {
    async fn connect(&self, config: &DeviceConfig) -> Result<ConnectionHandle, DriverError> {
        let handle = self.inner.connect(config).await?;
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }

    async fn capture_frame(&self, handle: &ConnectionHandle) -> Result<Frame, DriverError> {
        self.inner.capture_frame(handle).await
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), DriverError> {
        self.inner.disconnect(handle).await
    }
}

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        capture_interval_ms: 10,
        buffer_capacity: 5,
        driver_timeout_ms: 200,
        ..RegistryConfig::default()
    }
}

fn setup(config: RegistryConfig) -> (DeviceRegistry, Arc<SimulatedDriver>) {
    let driver = Arc::new(SimulatedDriver::new());
    let registry = DeviceRegistry::new(config, driver.clone());
    (registry, driver)
}

#[tokio::test]
async fn register_connect_disconnect() {
    env_logger::try_init().ok();
    let (registry, driver) = setup(fast_config());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera).at("lobby"))
        .unwrap();

    assert!(matches!(
        registry.register(DeviceConfig::new("cam-1", DeviceKind::Camera)),
        Err(DeviceError::AlreadyRegistered(_))
    ));
    assert!(matches!(
        registry.register(DeviceConfig::new(" ", DeviceKind::Camera)),
        Err(DeviceError::Validation(_))
    ));

    let info = registry.connect("cam-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Online);
    assert!(info.connected_at.is_some());
    assert_eq!(driver.open_connections(), 1);

    assert!(matches!(
        registry.connect("cam-1").await,
        Err(DeviceError::InvalidState { .. })
    ));

    let info = registry.disconnect("cam-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Offline);
    assert_eq!(driver.open_connections(), 0);

    // idempotent
    registry.disconnect("cam-1").await.unwrap();
    assert!(matches!(
        registry.connect("nope").await,
        Err(DeviceError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn ring_buffer_keeps_latest_frames_in_order() {
    let (registry, _) = setup(fast_config());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    registry.start_capture("cam-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.stop_capture("cam-1").await.unwrap();

    let frames = registry.frames("cam-1", 100).await.unwrap();
    assert_eq!(frames.len(), 5);
    for pair in frames.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
    assert!(frames[0].sequence > 1, "oldest frames should have been evicted");
}

#[tokio::test(start_paused = true)]
async fn stop_capture_halts_delivery() {
    let (registry, _) = setup(fast_config());
    let (tx, mut rx) = mpsc::channel(1024);
    registry.set_sample_sink(tx);
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    registry.start_capture("cam-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let info = registry.stop_capture("cam-1").await.unwrap();
    assert!(!info.streaming);

    let mut delivered = 0;
    while rx.try_recv().is_ok() {
        delivered += 1;
    }
    assert!(delivered > 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err(), "frame delivered after stop");
    assert_eq!(
        registry.info("cam-1").await.unwrap().status,
        DeviceStatus::Online
    );
}

#[tokio::test(start_paused = true)]
async fn devices_without_recognition_capability_are_not_forwarded() {
    let (registry, _) = setup(fast_config());
    let (tx, mut rx) = mpsc::channel(16);
    registry.set_sample_sink(tx);
    registry
        .register(
            DeviceConfig::new("cam-2", DeviceKind::Camera)
                .with_capabilities([biogate_devices::Capability::MotionDetect]),
        )
        .unwrap();
    registry.connect("cam-2").await.unwrap();
    registry.capture_frame("cam-2").await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(registry.frames("cam-2", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_handle_after_disconnect_is_a_connection_error() {
    let driver = Arc::new(RecordingDriver::new());
    let registry = DeviceRegistry::new(fast_config(), driver.clone());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    registry.start_capture("cam-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stale = driver.last_handle();
    registry.disconnect("cam-1").await.unwrap();

    let err = driver.capture_frame(&stale).await.unwrap_err();
    assert!(matches!(err, DriverError::Disconnected { .. }));
    assert!(matches!(
        registry.capture_frame("cam-1").await,
        Err(DeviceError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn failed_connect_is_recorded_then_recoverable() {
    let (registry, driver) = setup(fast_config());
    let mut events = registry.subscribe();
    registry
        .register(DeviceConfig::new("fp-1", DeviceKind::FingerprintReader))
        .unwrap();
    driver.fail_next_connects("fp-1", 1);

    let err = registry.connect("fp-1").await.unwrap_err();
    assert!(matches!(err, DeviceError::Driver { .. }));
    let info = registry.info("fp-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Error);
    assert_eq!(info.error_count, 1);
    assert!(info.last_error.is_some());

    let mut saw_fault = false;
    while let Ok(ev) = events.try_recv() {
        if let DeviceEvent::Fault { fatal, .. } = ev {
            saw_fault = fatal;
        }
    }
    assert!(saw_fault);

    let info = registry.connect("fp-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Online);
    assert_eq!(info.error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn hung_capture_times_out_into_error_state() {
    let (registry, driver) = setup(fast_config());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    driver.hang_captures("cam-1", true);
    registry.start_capture("cam-1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let info = registry.info("cam-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Error);
    assert_eq!(info.error_count, 1);
    assert!(!info.streaming);
    assert!(info.last_error.unwrap().contains("timed out"));
    assert_eq!(driver.open_connections(), 0);

    // the loop released itself, so the device can come back
    driver.hang_captures("cam-1", false);
    registry.connect("cam-1").await.unwrap();
    registry.start_capture("cam-1").await.unwrap();
    registry.stop_capture("cam-1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_below_limit_keep_streaming() {
    let (registry, driver) = setup(fast_config());
    registry
        .register(DeviceConfig::new("fp-1", DeviceKind::FingerprintReader))
        .unwrap();
    registry.connect("fp-1").await.unwrap();
    driver.fail_next_captures("fp-1", 2);
    registry.start_capture("fp-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let info = registry.info("fp-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Online);
    assert!(info.streaming);
    assert_eq!(info.error_count, 2);

    let health = registry.health("fp-1").await.unwrap();
    assert_eq!(health.frames_dropped, 2);
    registry.stop_capture("fp-1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_policy_restores_stream() {
    let config = RegistryConfig {
        reconnect: ReconnectPolicy {
            enabled: true,
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
        },
        ..fast_config()
    };
    let (registry, driver) = setup(config);
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    driver.fail_next_captures("cam-1", 3);
    driver.fail_next_connects("cam-1", 1);
    registry.start_capture("cam-1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let info = registry.info("cam-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Online);
    assert!(info.streaming);
    // three capture failures plus one refused reconnect
    assert_eq!(info.error_count, 4);
    assert!(!registry.frames("cam-1", 5).await.unwrap().is_empty());
    registry.stop_capture("cam-1").await.unwrap();
}

#[tokio::test]
async fn calibration_is_clamped_and_recorded() {
    let (registry, _) = setup(fast_config());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    let cal = registry
        .calibrate(
            "cam-1",
            &CalibrationUpdate {
                brightness: Some(3.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cal.brightness, 2.0);

    let info = registry.info("cam-1").await.unwrap();
    assert_eq!(info.calibration.brightness, 2.0);
    assert!(info.calibrated_at.is_some());
}

#[tokio::test]
async fn auto_calibration_uses_buffered_frames() {
    let (registry, driver) = setup(fast_config());
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();

    assert!(matches!(
        registry.auto_calibrate("cam-1").await,
        Err(DeviceError::NoFrames(_))
    ));

    driver.script(
        "cam-1",
        (0..3).map(|_| {
            Frame::new("cam-1", 0.9, Payload::Card { code: String::new() }).with_brightness(0.9)
        }),
    );
    registry.connect("cam-1").await.unwrap();
    for _ in 0..3 {
        registry.capture_frame("cam-1").await.unwrap();
    }
    let report = registry.auto_calibrate("cam-1").await.unwrap();
    assert_eq!(report.samples, 3);
    assert!(report.adjusted);
    assert!(report.applied.brightness < 1.0);
}

#[tokio::test]
async fn deactivated_devices_stay_listed_but_cannot_connect() {
    let (registry, _) = setup(fast_config());
    registry
        .register(DeviceConfig::new("card-1", DeviceKind::CardReader))
        .unwrap();
    registry.connect("card-1").await.unwrap();
    let info = registry.deactivate("card-1").await.unwrap();
    assert!(!info.active);
    assert_eq!(info.status, DeviceStatus::Offline);

    assert!(matches!(
        registry.connect("card-1").await,
        Err(DeviceError::Deactivated(_))
    ));
    assert_eq!(registry.list().await.len(), 1);

    let health = registry.health("card-1").await.unwrap();
    assert!(!health.recommendations.iter().any(|r| r == "check connection"));
}

fn backoff_config(enabled: bool) -> RegistryConfig {
    RegistryConfig {
        reconnect: ReconnectPolicy {
            enabled,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 2_000,
        },
        ..fast_config()
    }
}

#[tokio::test(start_paused = true)]
async fn manual_connect_during_backoff_takes_over_the_device() {
    let (registry, driver) = setup(backoff_config(true));
    registry
        .register(DeviceConfig::new("cam-1", DeviceKind::Camera))
        .unwrap();
    registry.connect("cam-1").await.unwrap();
    driver.fail_next_captures("cam-1", 3);
    registry.start_capture("cam-1").await.unwrap();

    // faulted, loop now waiting out its first backoff
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(registry.info("cam-1").await.unwrap().status, DeviceStatus::Error);
    assert_eq!(driver.open_connections(), 0);

    registry.connect("cam-1").await.unwrap();
    let info = registry.start_capture("cam-1").await.unwrap();
    assert!(info.streaming);
    assert_eq!(driver.open_connections(), 1);

    // the old loop is gone and never opens a second connection
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(driver.open_connections(), 1);
    assert!(!registry.frames("cam-1", 5).await.unwrap().is_empty());

    registry.disconnect("cam-1").await.unwrap();
    assert_eq!(driver.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_after_fatal_fault_runs_a_new_loop() {
    let (registry, driver) = setup(backoff_config(false));
    registry
        .register(DeviceConfig::new("fp-1", DeviceKind::FingerprintReader))
        .unwrap();
    registry.connect("fp-1").await.unwrap();
    driver.fail_next_captures("fp-1", 3);
    registry.start_capture("fp-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let info = registry.info("fp-1").await.unwrap();
    assert_eq!(info.status, DeviceStatus::Error);
    assert!(!info.streaming);

    registry.connect("fp-1").await.unwrap();
    registry.start_capture("fp-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!registry.frames("fp-1", 5).await.unwrap().is_empty());
    assert_eq!(driver.open_connections(), 1);
    registry.stop_capture("fp-1").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn devices_capture_in_parallel() {
    let (registry, driver) = setup(fast_config());
    let (tx, mut rx) = mpsc::channel(4096);
    registry.set_sample_sink(tx);
    let ids: Vec<String> = (1..=4).map(|n| format!("cam-{n}")).collect();
    for id in &ids {
        registry
            .register(DeviceConfig::new(id.as_str(), DeviceKind::Camera))
            .unwrap();
    }

    let mut starts = Vec::new();
    for id in ids.clone() {
        let registry = registry.clone();
        starts.push(tokio::spawn(async move {
            registry.connect(&id).await?;
            registry.start_capture(&id).await
        }));
    }
    for start in starts {
        assert!(start.await.unwrap().unwrap().streaming);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    for id in &ids {
        let frames = registry.frames(id, 100).await.unwrap();
        assert!(!frames.is_empty(), "{id} captured nothing");
        assert!(frames.iter().all(|f| &f.device_id == id));
    }
    registry.shutdown().await;
    assert_eq!(driver.open_connections(), 0);

    let mut seen = std::collections::BTreeSet::new();
    while let Ok(sample) = rx.try_recv() {
        seen.insert(sample.device_id);
    }
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), ids);
}
