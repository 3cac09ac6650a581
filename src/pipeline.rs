use std::sync::Arc;

use biogate_devices::{CapturedSample, Frame, Modality};
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventLog, RecognitionEvent, RecognitionOutcome, ReviewItem, ReviewQueue};
use crate::extract::Extractor;
use crate::identity::IdentityId;
use crate::matcher::{self, MatchConfig, MatchOutcome, MatchResult};
use crate::quality::{Purpose, QualityGate, QualityReport};
use crate::store::{Enrolled, EnrollmentRecord, TemplateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    SampleAcquired,
    QualityChecked,
    TemplateExtracted,
    Matched,
    Identified,
    Unidentified,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub stage: Stage,
    pub trace: Vec<Stage>,
    pub event: RecognitionEvent,
    pub quality: QualityReport,
    pub matched: Option<MatchResult>,
    pub best_score: Option<f32>,
    pub flagged_for_review: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum EnrollOutcome {
    Enrolled {
        template_id: Uuid,
        version: u32,
        record: EnrollmentRecord,
        quality: QualityReport,
    },
    Rejected {
        quality: QualityReport,
    },
}

/// Single-sample recognition: quality gate, feature extraction, matching and
/// event recording. Holds no mutable state of its own.
pub struct RecognitionPipeline {
    store: Arc<TemplateStore>,
    gate: QualityGate,
    extractor: Arc<dyn Extractor>,
    matching: MatchConfig,
    log: Arc<EventLog>,
    review: Arc<ReviewQueue>,
    bus: EventBus,
}

impl RecognitionPipeline {
    pub fn new(
        store: Arc<TemplateStore>,
        gate: QualityGate,
        extractor: Arc<dyn Extractor>,
        matching: MatchConfig,
        log: Arc<EventLog>,
        review: Arc<ReviewQueue>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            gate,
            extractor,
            matching,
            log,
            review,
            bus,
        }
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn matching(&self) -> &MatchConfig {
        &self.matching
    }

    /// Quality-checks and stores a sample as a new template version.
    pub fn enroll(
        &self,
        identity: &IdentityId,
        modality: Modality,
        frame: &Frame,
    ) -> EngineResult<EnrollOutcome> {
        self.enroll_with(identity, modality, frame, |_| Ok(()))
    }

    /// Enrollment whose template is only kept once `persist` succeeds.
    pub fn enroll_with(
        &self,
        identity: &IdentityId,
        modality: Modality,
        frame: &Frame,
        persist: impl FnOnce(&Enrolled) -> EngineResult<()>,
    ) -> EngineResult<EnrollOutcome> {
        if frame.modality() != modality {
            return Err(EngineError::Validation(format!(
                "{} sample submitted for {modality} enrollment",
                frame.modality()
            )));
        }
        let mut quality = self.gate.assess(frame, Purpose::Enrollment);
        if !quality.passed {
            return Ok(EnrollOutcome::Rejected { quality });
        }
        let Some(features) = self.extractor.extract(frame) else {
            quality.reject("no extractable features");
            return Ok(EnrollOutcome::Rejected { quality });
        };
        let enrolled = self.store.insert_with(
            identity,
            features,
            frame.quality,
            quality.passed,
            persist,
        )?;
        debug!(
            "enrolled {} {} template v{}",
            identity, modality, enrolled.template.version
        );
        Ok(EnrollOutcome::Enrolled {
            template_id: enrolled.template.id,
            version: enrolled.template.version,
            record: enrolled.record,
            quality,
        })
    }

    /// Runs one sample through the pipeline. With a `claimed` identity the
    /// match is 1:1, otherwise 1:N. The device is taken from the frame.
    pub fn run(&self, frame: Frame, claimed: Option<&IdentityId>) -> EngineResult<PipelineOutcome> {
        let modality = frame.modality();
        let mut trace = vec![Stage::Idle, Stage::SampleAcquired];

        let mut quality = self.gate.assess(&frame, Purpose::Recognition);
        trace.push(Stage::QualityChecked);
        let features = if quality.passed {
            self.extractor.extract(&frame)
        } else {
            None
        };
        let Some(features) = features else {
            if quality.passed {
                quality.reject("no extractable features");
            }
            let event = self.event(&frame, claimed.cloned(), 0.0, false, RecognitionOutcome::LowQuality, &quality);
            self.record(&event);
            return Ok(PipelineOutcome {
                stage: Stage::QualityChecked,
                trace,
                event,
                quality,
                matched: None,
                best_score: None,
                flagged_for_review: false,
            });
        };
        trace.push(Stage::TemplateExtracted);

        let threshold = self.matching.threshold(modality);
        let outcome = match claimed {
            Some(identity) => matcher::verify(&self.store, identity, &features, modality, threshold, &self.matching)?,
            None => matcher::identify(&self.store, &features, modality, threshold, &self.matching)?,
        };
        trace.push(Stage::Matched);
        let best_score = outcome.best().map(|m| m.score);

        match outcome {
            MatchOutcome::Match(m) => {
                trace.push(Stage::Identified);
                let event = self.event(
                    &frame,
                    Some(m.identity.clone()),
                    m.score,
                    true,
                    RecognitionOutcome::Identified,
                    &quality,
                );
                self.record(&event);
                Ok(PipelineOutcome {
                    stage: Stage::Identified,
                    trace,
                    event,
                    quality,
                    matched: Some(m),
                    best_score,
                    flagged_for_review: false,
                })
            }
            MatchOutcome::NoMatch { .. } => {
                trace.push(Stage::Unidentified);
                let event = self.event(
                    &frame,
                    claimed.cloned(),
                    best_score.unwrap_or(0.0),
                    false,
                    RecognitionOutcome::Unidentified,
                    &quality,
                );
                self.record(&event);
                let evicted = self.review.push(ReviewItem {
                    event_id: event.id,
                    device_id: frame.device_id.clone(),
                    modality,
                    best_score,
                    frame,
                    flagged_at: Utc::now(),
                });
                if let Some(old) = evicted {
                    debug!("review queue full, dropped item for event {}", old.event_id);
                }
                Ok(PipelineOutcome {
                    stage: Stage::Unidentified,
                    trace,
                    event,
                    quality,
                    matched: None,
                    best_score,
                    flagged_for_review: true,
                })
            }
        }
    }

    fn event(
        &self,
        frame: &Frame,
        identity: Option<IdentityId>,
        confidence: f32,
        verified: bool,
        outcome: RecognitionOutcome,
        quality: &QualityReport,
    ) -> RecognitionEvent {
        RecognitionEvent {
            id: Uuid::new_v4(),
            identity,
            modality: frame.modality(),
            device_id: frame.device_id.clone(),
            confidence,
            timestamp: Utc::now(),
            verified,
            outcome,
            quality: quality.metrics.clone(),
        }
    }

    fn record(&self, event: &RecognitionEvent) {
        self.log.append(event.clone());
        self.bus.publish_recognition(event.clone());
    }

    /// Drains frames forwarded by capture loops until every sender is gone.
    pub fn spawn_consumer(self: Arc<Self>, mut samples: mpsc::Receiver<CapturedSample>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                match self.run(sample.frame, None) {
                    Ok(outcome) => debug!(
                        "{} sample from {}: {:?}",
                        outcome.event.modality, sample.device_id, outcome.stage
                    ),
                    Err(e) => warn!("recognition failed for {}: {}", sample.device_id, e),
                }
            }
            debug!("sample consumer stopped");
        })
    }
}
