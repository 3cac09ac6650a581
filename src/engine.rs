use std::sync::Arc;

use biogate_devices::{
    AutoCalibrationReport, Calibration, CalibrationUpdate, DeviceConfig, DeviceDriver, DeviceEvent,
    DeviceHealth, DeviceInfo, DeviceRegistry, Frame, Modality, SimulatedDriver,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventLog, RecognitionEvent, ReviewItem, ReviewQueue};
use crate::extract::{Extractor, PlaceholderExtractor};
use crate::fusion::{self, FusionResult};
use crate::identity::IdentityId;
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::pipeline::{EnrollOutcome, PipelineOutcome, RecognitionPipeline};
use crate::quality::QualityGate;
use crate::stats::{DeviceStats, RecognitionStats};
use crate::storage::{FileRepository, TemplateRepository};
use crate::store::{EnrollmentRecord, TemplateStore};

pub struct EngineBuilder {
    config: Config,
    driver: Option<Arc<dyn DeviceDriver>>,
    repository: Option<Arc<dyn TemplateRepository>>,
    extractor: Option<Arc<dyn Extractor>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn TemplateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Restores persisted templates and starts the background tasks. Must be
    /// called from within a tokio runtime.
    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        let driver = self
            .driver
            .unwrap_or_else(|| Arc::new(SimulatedDriver::new()));
        let repository = self.repository.unwrap_or_else(|| {
            Arc::new(FileRepository::new(config.storage.template_dir()))
        });
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(PlaceholderExtractor::default()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let store = Arc::new(TemplateStore::new(config.enrollment.limits()));
        let mut restored = 0;
        for identity in repository.identities()? {
            let templates = repository.load_templates(&identity, None)?;
            let record = repository.load_enrollment(&identity)?;
            if templates.is_empty() && record.is_none() {
                continue;
            }
            store.restore(&identity, templates, record);
            restored += 1;
        }
        if restored > 0 {
            info!("restored templates for {} identities", restored);
        }

        let log = Arc::new(EventLog::new(config.events.max_events));
        let review = Arc::new(ReviewQueue::new(config.events.review_capacity));
        let bus = EventBus::new(config.events.channel_capacity);
        let pipeline = Arc::new(RecognitionPipeline::new(
            store.clone(),
            QualityGate::new(config.quality.clone()),
            extractor,
            config.matching.clone(),
            log.clone(),
            review.clone(),
            bus.clone(),
        ));

        let registry = DeviceRegistry::new(config.devices.clone(), driver);
        let (sink, samples) = mpsc::channel(config.events.sample_queue.max(1));
        registry.set_sample_sink(sink);

        let tasks = vec![
            pipeline.clone().spawn_consumer(samples),
            spawn_forwarder(
                notifier,
                bus.subscribe_recognition(),
                bus.subscribe_anomalies(),
                registry.subscribe(),
            ),
        ];

        Ok(Engine {
            detector: AnomalyDetector::new(config.anomaly.clone()),
            config,
            registry,
            pipeline,
            store,
            log,
            review,
            bus,
            repository,
            tasks: Mutex::new(tasks),
        })
    }
}

fn spawn_forwarder(
    notifier: Arc<dyn Notifier>,
    mut recognition: broadcast::Receiver<RecognitionEvent>,
    mut anomalies: broadcast::Receiver<Anomaly>,
    mut devices: broadcast::Receiver<DeviceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                r = recognition.recv() => r.map(Notification::Recognition),
                a = anomalies.recv() => a.map(Notification::Anomaly),
                d = devices.recv() => d.map(Notification::Device),
            };
            match next {
                Ok(n) => notifier.notify(&n),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("notifier fell behind, skipped {} messages", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("notification forwarder stopped");
    })
}

/// Owns every component and exposes the management operations.
pub struct Engine {
    config: Config,
    registry: DeviceRegistry,
    pipeline: Arc<RecognitionPipeline>,
    store: Arc<TemplateStore>,
    log: Arc<EventLog>,
    review: Arc<ReviewQueue>,
    bus: EventBus,
    repository: Arc<dyn TemplateRepository>,
    detector: AnomalyDetector,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            driver: None,
            repository: None,
            extractor: None,
            notifier: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn subscribe_recognition(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.bus.subscribe_recognition()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Anomaly> {
        self.bus.subscribe_anomalies()
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceEvent> {
        self.registry.subscribe()
    }

    // devices

    pub fn register_device(&self, config: DeviceConfig) -> EngineResult<DeviceInfo> {
        Ok(self.registry.register(config)?)
    }

    pub async fn deactivate_device(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.deactivate(device_id).await?)
    }

    pub async fn connect_device(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.connect(device_id).await?)
    }

    pub async fn disconnect_device(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.disconnect(device_id).await?)
    }

    pub async fn start_capture(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.start_capture(device_id).await?)
    }

    pub async fn stop_capture(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.stop_capture(device_id).await?)
    }

    pub async fn capture_frame(&self, device_id: &str) -> EngineResult<Frame> {
        Ok(self.registry.capture_frame(device_id).await?)
    }

    pub async fn calibrate_device(
        &self,
        device_id: &str,
        update: &CalibrationUpdate,
    ) -> EngineResult<Calibration> {
        Ok(self.registry.calibrate(device_id, update).await?)
    }

    pub async fn auto_calibrate(&self, device_id: &str) -> EngineResult<AutoCalibrationReport> {
        Ok(self.registry.auto_calibrate(device_id).await?)
    }

    pub async fn device(&self, device_id: &str) -> EngineResult<DeviceInfo> {
        Ok(self.registry.info(device_id).await?)
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.list().await
    }

    pub async fn device_health(&self, device_id: &str) -> EngineResult<DeviceHealth> {
        Ok(self.registry.health(device_id).await?)
    }

    pub async fn health_all(&self) -> Vec<DeviceHealth> {
        self.registry.health_all().await
    }

    // identities

    /// Quality-gates `frame` and, if accepted, stores and persists a new template.
    pub fn enroll(
        &self,
        identity: &IdentityId,
        modality: Modality,
        frame: &Frame,
    ) -> EngineResult<EnrollOutcome> {
        let repository = &self.repository;
        let outcome = self.pipeline.enroll_with(identity, modality, frame, |enrolled| {
            repository.save_template(&enrolled.template)?;
            if let Err(err) = repository.save_enrollment(&enrolled.record) {
                if let Err(undo) = repository.remove_templates(identity, &[enrolled.template.id]) {
                    warn!("could not withdraw template {}: {}", enrolled.template.id, undo);
                }
                return Err(err);
            }
            // restore trims versions left behind here
            if let Err(err) = repository.remove_templates(identity, &enrolled.pruned) {
                warn!("pruning old templates for {} failed: {}", identity, err);
            }
            Ok(())
        })?;
        match &outcome {
            EnrollOutcome::Enrolled { version, .. } => {
                info!("✓ {} template v{} enrolled for {}", modality, version, identity);
            }
            EnrollOutcome::Rejected { quality } => {
                info!(
                    "{} sample for {} rejected: {}",
                    modality,
                    identity,
                    quality.reasons.join(", ")
                );
            }
        }
        Ok(outcome)
    }

    /// Captures one frame from `device_id` and enrolls it.
    pub async fn enroll_from_device(
        &self,
        identity: &IdentityId,
        device_id: &str,
    ) -> EngineResult<EnrollOutcome> {
        let frame = self.registry.capture_frame(device_id).await?;
        self.enroll(identity, frame.modality(), &frame)
    }

    pub fn identify(&self, frame: Frame) -> EngineResult<PipelineOutcome> {
        self.pipeline.run(frame, None)
    }

    pub fn verify(&self, identity: &IdentityId, frame: Frame) -> EngineResult<PipelineOutcome> {
        if !self.store.contains(identity) {
            return Err(EngineError::not_found("identity", identity.as_str()));
        }
        self.pipeline.run(frame, Some(identity))
    }

    /// Multi-modal verification; `required_matches` overrides the configured policy.
    pub fn authenticate(
        &self,
        identity: &IdentityId,
        samples: Vec<Frame>,
        required_matches: Option<usize>,
    ) -> EngineResult<FusionResult> {
        let mut policy = self.config.fusion.clone();
        if let Some(required) = required_matches {
            policy.required_matches = required;
        }
        let result = fusion::authenticate(&self.pipeline, &policy, identity, samples)?;
        info!(
            "authentication for {}: {:?} ({}/{} modalities, confidence {:.3})",
            identity, result.decision, result.matched, result.required, result.confidence
        );
        Ok(result)
    }

    pub fn enrollment(&self, identity: &IdentityId) -> EngineResult<EnrollmentRecord> {
        self.store
            .enrollment(identity)
            .ok_or_else(|| EngineError::not_found("identity", identity.as_str()))
    }

    pub fn identities(&self) -> Vec<IdentityId> {
        self.store.identities()
    }

    /// Removes an identity from memory and storage. Returns whether it was enrolled.
    pub fn purge_identity(&self, identity: &IdentityId) -> EngineResult<bool> {
        let existed = self.store.purge(identity);
        self.repository.purge(identity)?;
        if existed {
            info!("✓ purged {}", identity);
        }
        Ok(existed)
    }

    // events

    pub fn recent_events(&self, limit: usize) -> Vec<RecognitionEvent> {
        self.log.recent(limit)
    }

    /// Runs the detector over the matching slice of the event log and
    /// publishes what it finds.
    pub fn anomalies(&self, identity: Option<&IdentityId>, device_id: Option<&str>) -> Vec<Anomaly> {
        let mut events = match identity {
            Some(id) => self.log.for_identity(id),
            None => self.log.snapshot(),
        };
        if let Some(device) = device_id {
            events.retain(|e| e.device_id == device);
        }
        let found = self.detector.detect(&events);
        for anomaly in &found {
            self.bus.publish_anomaly(anomaly.clone());
        }
        found
    }

    pub fn recognition_stats(&self) -> RecognitionStats {
        RecognitionStats::from_events(&self.log.snapshot())
    }

    pub async fn device_stats(&self) -> DeviceStats {
        DeviceStats::from_devices(&self.registry.list().await)
    }

    pub fn review_queue(&self) -> Vec<ReviewItem> {
        self.review.list()
    }

    pub fn drain_review_queue(&self) -> Vec<ReviewItem> {
        self.review.drain()
    }

    /// Stops capture on every device and ends the background tasks.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
