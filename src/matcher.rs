//! Nearest-neighbor template matching. Scores are similarities in [0, 1];
//! the highest-scoring template wins and is accepted only at or above the
//! modality threshold. This is not a calibrated classifier.

use biogate_devices::{Minutia, Modality};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityId;
use crate::store::TemplateStore;
use crate::template::{Features, Template};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub face_threshold: f32,
    pub fingerprint_threshold: f32,
    pub card_threshold: f32,
    pub minutiae_tolerance_px: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            face_threshold: 0.95,
            fingerprint_threshold: 0.98,
            card_threshold: 1.0,
            minutiae_tolerance_px: 10.0,
        }
    }
}

impl MatchConfig {
    pub fn threshold(&self, modality: Modality) -> f32 {
        match modality {
            Modality::Face => self.face_threshold,
            Modality::Fingerprint => self.fingerprint_threshold,
            Modality::Card => self.card_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: IdentityId,
    pub score: f32,
    pub template_id: Uuid,
    pub modality: Modality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum MatchOutcome {
    Match(MatchResult),
    NoMatch { best: Option<MatchResult> },
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&MatchResult> {
        match self {
            MatchOutcome::Match(m) => Some(m),
            MatchOutcome::NoMatch { .. } => None,
        }
    }

    pub fn best(&self) -> Option<&MatchResult> {
        match self {
            MatchOutcome::Match(m) => Some(m),
            MatchOutcome::NoMatch { best } => best.as_ref(),
        }
    }
}

/// Cosine of the angle between `a` and `b`, or 0 when either has no magnitude
/// or the dimensions differ.
pub fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let na = a.dot(a).sqrt();
    let nb = b.dot(b).sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (a.dot(b) / (na * nb)).clamp(-1.0, 1.0)
}

pub fn similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    cosine_similarity(a, b).max(0.0)
}

/// Fraction of minutiae that pair up one-to-one within `tolerance` pixels and
/// share a kind, over the larger set. Pairing is a maximum matching, so the
/// result does not depend on the order of either list.
pub fn minutiae_overlap(query: &[Minutia], stored: &[Minutia], tolerance: f32) -> f32 {
    let larger = query.len().max(stored.len());
    if larger == 0 {
        return 0.0;
    }
    // stored indices each query minutia may pair with, nearest first
    let candidates: Vec<Vec<usize>> = query
        .iter()
        .map(|p| {
            let mut near: Vec<(usize, f32)> = stored
                .iter()
                .enumerate()
                .filter(|(_, s)| s.kind == p.kind)
                .map(|(i, s)| (i, p.distance(s)))
                .filter(|(_, d)| *d <= tolerance)
                .collect();
            near.sort_by(|x, y| x.1.total_cmp(&y.1));
            near.into_iter().map(|(i, _)| i).collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; stored.len()];
    let mut paired = 0usize;
    for p in 0..query.len() {
        let mut seen = vec![false; stored.len()];
        if augment(p, &candidates, &mut owner, &mut seen) {
            paired += 1;
        }
    }
    paired as f32 / larger as f32
}

/// Kuhn's augmenting path step: pair query `p`, re-pairing earlier ones if needed.
fn augment(
    p: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for &s in &candidates[p] {
        if seen[s] {
            continue;
        }
        seen[s] = true;
        if owner[s].map_or(true, |q| augment(q, candidates, owner, seen)) {
            owner[s] = Some(p);
            return true;
        }
    }
    false
}

/// Similarity of two feature sets; 0 for mismatched kinds.
pub fn score(query: &Features, stored: &Features, cfg: &MatchConfig) -> f32 {
    match (query, stored) {
        (Features::Vector(a), Features::Vector(b)) => similarity(a, b),
        (Features::Minutiae(a), Features::Minutiae(b)) => {
            minutiae_overlap(a, b, cfg.minutiae_tolerance_px)
        }
        (Features::Card(a), Features::Card(b)) => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn check(query: &Features, modality: Modality, threshold: f32) -> EngineResult<()> {
    if query.modality() != modality {
        return Err(EngineError::Validation(format!(
            "{} features cannot be matched as {modality}",
            query.modality()
        )));
    }
    if !(0.0..=1.0).contains(&threshold) {
        return Err(EngineError::Validation(format!(
            "threshold {threshold} outside [0, 1]"
        )));
    }
    Ok(())
}

fn best_candidate(
    store: &TemplateStore,
    identity: Option<&IdentityId>,
    query: &Features,
    modality: Modality,
    cfg: &MatchConfig,
) -> Option<(MatchResult, u64)> {
    let mut best: Option<(MatchResult, u64)> = None;
    store.visit(modality, identity, |t: &Template| {
        let s = score(query, &t.features, cfg);
        let better = match &best {
            None => true,
            Some((b, seq)) => s > b.score || (s == b.score && t.sequence < *seq),
        };
        if better {
            best = Some((
                MatchResult {
                    identity: t.identity.clone(),
                    score: s,
                    template_id: t.id,
                    modality,
                },
                t.sequence,
            ));
        }
    });
    best
}

fn decide(best: Option<(MatchResult, u64)>, threshold: f32) -> MatchOutcome {
    match best {
        Some((m, _)) if m.score >= threshold => MatchOutcome::Match(m),
        other => MatchOutcome::NoMatch {
            best: other.map(|(m, _)| m),
        },
    }
}

/// 1:N search over every template of `modality`.
pub fn identify(
    store: &TemplateStore,
    query: &Features,
    modality: Modality,
    threshold: f32,
    cfg: &MatchConfig,
) -> EngineResult<MatchOutcome> {
    check(query, modality, threshold)?;
    Ok(decide(
        best_candidate(store, None, query, modality, cfg),
        threshold,
    ))
}

/// 1:1 check against the templates of a claimed identity.
pub fn verify(
    store: &TemplateStore,
    identity: &IdentityId,
    query: &Features,
    modality: Modality,
    threshold: f32,
    cfg: &MatchConfig,
) -> EngineResult<MatchOutcome> {
    check(query, modality, threshold)?;
    Ok(decide(
        best_candidate(store, Some(identity), query, modality, cfg),
        threshold,
    ))
}
