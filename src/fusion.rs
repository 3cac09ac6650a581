use std::collections::{BTreeMap, BTreeSet};

use biogate_devices::{Frame, Modality};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityId;
use crate::pipeline::{RecognitionPipeline, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Authenticated,
    Rejected,
}

/// How many modalities must agree with the claim, and how each contributes
/// to the confidence. Modalities without a weight get 1/n.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPolicy {
    pub required_matches: usize,
    pub weights: BTreeMap<Modality, f32>,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            required_matches: 1,
            weights: BTreeMap::new(),
        }
    }
}

impl FusionPolicy {
    pub fn requiring(required_matches: usize) -> Self {
        Self {
            required_matches,
            ..Self::default()
        }
    }

    pub fn weight(&self, modality: Modality, sample_count: usize) -> f32 {
        self.weights
            .get(&modality)
            .copied()
            .unwrap_or(1.0 / sample_count.max(1) as f32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityResult {
    pub modality: Modality,
    pub agreed: bool,
    pub score: f32,
    pub threshold: f32,
    pub stage: Stage,
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionResult {
    pub identity: IdentityId,
    pub decision: Decision,
    pub matched: usize,
    pub required: usize,
    pub confidence: f32,
    pub per_modality: Vec<ModalityResult>,
}

/// Combines independent per-modality results under `policy`.
pub fn fuse(identity: IdentityId, policy: &FusionPolicy, per_modality: Vec<ModalityResult>) -> FusionResult {
    let n = per_modality.len();
    let matched = per_modality.iter().filter(|r| r.agreed).count();
    let confidence = per_modality
        .iter()
        .filter(|r| r.agreed)
        .map(|r| policy.weight(r.modality, n) * r.score)
        .sum::<f32>()
        .clamp(0.0, 1.0);
    let decision = if matched >= policy.required_matches {
        Decision::Authenticated
    } else {
        Decision::Rejected
    };
    FusionResult {
        identity,
        decision,
        matched,
        required: policy.required_matches,
        confidence,
        per_modality,
    }
}

fn validate(pipeline: &RecognitionPipeline, identity: &IdentityId, policy: &FusionPolicy, samples: &[Frame]) -> EngineResult<()> {
    if samples.is_empty() {
        return Err(EngineError::Validation("no samples supplied".into()));
    }
    let mut seen = BTreeSet::new();
    for frame in samples {
        if !seen.insert(frame.modality()) {
            return Err(EngineError::Validation(format!(
                "more than one {} sample supplied",
                frame.modality()
            )));
        }
    }
    if policy.required_matches == 0 || policy.required_matches > samples.len() {
        return Err(EngineError::Validation(format!(
            "required matches {} must be between 1 and {}",
            policy.required_matches,
            samples.len()
        )));
    }
    if let Some((modality, w)) = policy.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(EngineError::Validation(format!("invalid {modality} weight {w}")));
    }
    if !pipeline.store().contains(identity) {
        return Err(EngineError::not_found("identity", identity.as_str()));
    }
    Ok(())
}

/// Multi-modal verification of a claimed identity: one pipeline pass per sample.
pub fn authenticate(
    pipeline: &RecognitionPipeline,
    policy: &FusionPolicy,
    identity: &IdentityId,
    samples: Vec<Frame>,
) -> EngineResult<FusionResult> {
    validate(pipeline, identity, policy, &samples)?;

    let mut per_modality = Vec::with_capacity(samples.len());
    for frame in samples {
        let modality = frame.modality();
        let outcome = pipeline.run(frame, Some(identity))?;
        let agreed = outcome
            .matched
            .as_ref()
            .is_some_and(|m| &m.identity == identity);
        per_modality.push(ModalityResult {
            modality,
            agreed,
            score: outcome.best_score.unwrap_or(0.0),
            threshold: pipeline.matching().threshold(modality),
            stage: outcome.stage,
            event_id: Some(outcome.event.id),
        });
    }
    Ok(fuse(identity.clone(), policy, per_modality))
}
