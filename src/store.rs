use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use biogate_devices::Modality;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::IdentityId;
use crate::template::{Features, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrollmentStatus {
    PendingVerification,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub template_id: Uuid,
    pub modality: Modality,
    pub version: u32,
    pub quality: f32,
    /// Whether the sample met the enrollment quality minimum.
    pub acceptable: bool,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity: IdentityId,
    pub templates: Vec<TemplateRef>,
    pub status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnrollmentRecord {
    pub fn new(identity: IdentityId) -> Self {
        let now = Utc::now();
        Self {
            identity,
            templates: Vec::new(),
            status: EnrollmentStatus::PendingVerification,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn acceptable_templates(&self) -> usize {
        self.templates.iter().filter(|t| t.acceptable).count()
    }

    /// Promotes the record once enough acceptable templates exist. Returns the
    /// resulting activity.
    pub fn try_activate(&mut self, min_templates: usize) -> bool {
        if self.status == EnrollmentStatus::Active {
            return true;
        }
        if self.acceptable_templates() >= min_templates.max(1) {
            self.status = EnrollmentStatus::Active;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

/// Result of adding a template: the stored template, the updated record and
/// the ids of templates pruned to stay within the per-modality limit.
#[derive(Debug, Clone)]
pub struct Enrolled {
    pub template: Template,
    pub record: EnrollmentRecord,
    pub pruned: Vec<Uuid>,
}

#[derive(Debug)]
struct IdentityEntry {
    templates: BTreeMap<Modality, Vec<Template>>,
    record: EnrollmentRecord,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_templates_per_modality: usize,
    pub activation_min_templates: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_templates_per_modality: 10,
            activation_min_templates: 1,
        }
    }
}

/// In-memory template index. Each identity has its own lock; the outer map
/// lock is only held to find or insert an entry.
#[derive(Debug)]
pub struct TemplateStore {
    identities: RwLock<HashMap<IdentityId, Arc<RwLock<IdentityEntry>>>>,
    sequence: AtomicU64,
    limits: StoreLimits,
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl TemplateStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(1),
            limits,
        }
    }

    fn entry(&self, identity: &IdentityId) -> Arc<RwLock<IdentityEntry>> {
        if let Some(entry) = self.identities.read().get(identity) {
            return entry.clone();
        }
        self.identities
            .write()
            .entry(identity.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(IdentityEntry {
                    templates: BTreeMap::new(),
                    record: EnrollmentRecord::new(identity.clone()),
                }))
            })
            .clone()
    }

    fn existing(&self, identity: &IdentityId) -> Option<Arc<RwLock<IdentityEntry>>> {
        self.identities.read().get(identity).cloned()
    }

    /// Appends a new template version for `identity`.
    pub fn insert(
        &self,
        identity: &IdentityId,
        features: Features,
        quality: f32,
        acceptable: bool,
    ) -> Enrolled {
        match self.insert_with(identity, features, quality, acceptable, |_| {
            Ok::<(), Infallible>(())
        }) {
            Ok(enrolled) => enrolled,
            Err(never) => match never {},
        }
    }

    /// Like [`insert`](Self::insert), but the new version only becomes visible
    /// once `persist` accepts it. The identity stays write-locked while
    /// `persist` runs, and an error leaves the store as it was.
    pub fn insert_with<E>(
        &self,
        identity: &IdentityId,
        features: Features,
        quality: f32,
        acceptable: bool,
        persist: impl FnOnce(&Enrolled) -> Result<(), E>,
    ) -> Result<Enrolled, E> {
        let modality = features.modality();
        let handle = self.entry(identity);
        let mut entry = handle.write();

        let versions = entry.templates.get(&modality).map(Vec::as_slice).unwrap_or(&[]);
        let version = versions.iter().map(|t| t.version).max().unwrap_or(0) + 1;
        let max = self.limits.max_templates_per_modality.max(1);
        let excess = (versions.len() + 1).saturating_sub(max);
        let pruned: Vec<Uuid> = versions.iter().take(excess).map(|t| t.id).collect();

        let template = Template {
            id: Uuid::new_v4(),
            identity: identity.clone(),
            modality,
            version,
            quality,
            enrolled_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            features,
        };
        let mut record = entry.record.clone();
        record.templates.retain(|r| !pruned.contains(&r.template_id));
        record.templates.push(TemplateRef {
            template_id: template.id,
            modality,
            version,
            quality,
            acceptable,
            enrolled_at: template.enrolled_at,
        });
        record.updated_at = template.enrolled_at;
        record.try_activate(self.limits.activation_min_templates);

        let enrolled = Enrolled {
            template,
            record,
            pruned,
        };
        if let Err(err) = persist(&enrolled) {
            let vacant = entry.templates.is_empty();
            drop(entry);
            if vacant {
                self.forget_vacant(identity, &handle);
            }
            return Err(err);
        }

        let versions = entry.templates.entry(modality).or_default();
        versions.drain(..excess);
        versions.push(enrolled.template.clone());
        entry.record = enrolled.record.clone();
        Ok(enrolled)
    }

    /// Drops an entry created for an insert that never landed, unless someone
    /// else picked it up meanwhile.
    fn forget_vacant(&self, identity: &IdentityId, handle: &Arc<RwLock<IdentityEntry>>) {
        let mut identities = self.identities.write();
        let unused = identities
            .get(identity)
            .is_some_and(|e| Arc::ptr_eq(e, handle) && Arc::strong_count(handle) == 2);
        if unused && handle.read().templates.is_empty() {
            identities.remove(identity);
        }
    }

    /// Loads persisted state for one identity, replacing whatever is in memory.
    pub fn restore(&self, identity: &IdentityId, templates: Vec<Template>, record: Option<EnrollmentRecord>) {
        let mut by_modality: BTreeMap<Modality, Vec<Template>> = BTreeMap::new();
        for template in templates {
            self.sequence
                .fetch_max(template.sequence + 1, Ordering::Relaxed);
            by_modality.entry(template.modality).or_default().push(template);
        }
        let max = self.limits.max_templates_per_modality.max(1);
        for versions in by_modality.values_mut() {
            versions.sort_by_key(|t| t.sequence);
            let excess = versions.len().saturating_sub(max);
            versions.drain(..excess);
        }
        let record = record.unwrap_or_else(|| {
            let mut record = EnrollmentRecord::new(identity.clone());
            record.templates = by_modality
                .values()
                .flatten()
                .map(|t| TemplateRef {
                    template_id: t.id,
                    modality: t.modality,
                    version: t.version,
                    quality: t.quality,
                    acceptable: true,
                    enrolled_at: t.enrolled_at,
                })
                .collect();
            record.try_activate(self.limits.activation_min_templates);
            record
        });
        self.identities.write().insert(
            identity.clone(),
            Arc::new(RwLock::new(IdentityEntry {
                templates: by_modality,
                record,
            })),
        );
    }

    pub fn contains(&self, identity: &IdentityId) -> bool {
        self.identities.read().contains_key(identity)
    }

    pub fn has_modality(&self, identity: &IdentityId, modality: Modality) -> bool {
        self.existing(identity)
            .map(|e| e.read().templates.get(&modality).is_some_and(|v| !v.is_empty()))
            .unwrap_or(false)
    }

    pub fn templates(&self, identity: &IdentityId, modality: Option<Modality>) -> Vec<Template> {
        let Some(entry) = self.existing(identity) else {
            return Vec::new();
        };
        let entry = entry.read();
        entry
            .templates
            .iter()
            .filter(|(m, _)| modality.map_or(true, |want| **m == want))
            .flat_map(|(_, v)| v.iter().cloned())
            .collect()
    }

    pub fn enrollment(&self, identity: &IdentityId) -> Option<EnrollmentRecord> {
        self.existing(identity).map(|e| e.read().record.clone())
    }

    pub fn identities(&self) -> Vec<IdentityId> {
        let mut ids: Vec<_> = self.identities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Calls `f` for every template of `modality`, optionally limited to one identity.
    /// Entries are visited one lock at a time.
    pub fn visit(&self, modality: Modality, identity: Option<&IdentityId>, mut f: impl FnMut(&Template)) {
        let entries: Vec<_> = match identity {
            Some(id) => self.existing(id).into_iter().collect(),
            None => self.identities.read().values().cloned().collect(),
        };
        for entry in entries {
            let entry = entry.read();
            if let Some(versions) = entry.templates.get(&modality) {
                versions.iter().for_each(&mut f);
            }
        }
    }

    pub fn template_count(&self) -> usize {
        let entries: Vec<_> = self.identities.read().values().cloned().collect();
        entries
            .iter()
            .map(|e| e.read().templates.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Removes all templates and the enrollment record. Returns whether anything existed.
    pub fn purge(&self, identity: &IdentityId) -> bool {
        self.identities.write().remove(identity).is_some()
    }
}
