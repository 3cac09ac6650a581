use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use biogate_devices::Modality;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityId;
use crate::store::EnrollmentRecord;
use crate::template::Template;

const TEMPLATES_FILE: &str = "templates.bin";
const ENROLLMENT_FILE: &str = "enrollment.bin";

/// Durable home for templates and enrollment records.
pub trait TemplateRepository: Send + Sync {
    fn save_template(&self, template: &Template) -> EngineResult<()>;
    fn remove_templates(&self, identity: &IdentityId, ids: &[Uuid]) -> EngineResult<()>;
    fn save_enrollment(&self, record: &EnrollmentRecord) -> EngineResult<()>;
    fn load_templates(
        &self,
        identity: &IdentityId,
        modality: Option<Modality>,
    ) -> EngineResult<Vec<Template>>;
    fn load_enrollment(&self, identity: &IdentityId) -> EngineResult<Option<EnrollmentRecord>>;
    fn identities(&self) -> EngineResult<Vec<IdentityId>>;
    fn purge(&self, identity: &IdentityId) -> EngineResult<()>;
}

/// One directory per identity holding postcard-encoded `templates.bin` and
/// `enrollment.bin`. Writes for one identity are serialized; clones share the
/// same locks.
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::StorageIo {
        path: path.to_path_buf(),
        source,
    }
}

impl FileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_path(&self, identity: &IdentityId) -> PathBuf {
        self.root.join(identity.as_str())
    }

    fn lock(&self, identity: &IdentityId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(identity.clone()).or_default().clone()
    }

    fn read<T: DeserializeOwned + Default>(&self, file: &Path) -> EngineResult<T> {
        if !file.exists() {
            return Ok(T::default());
        }
        let data = std::fs::read(file).map_err(io_err(file))?;
        postcard::from_bytes(&data).map_err(|e| EngineError::StorageFormat {
            path: file.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn write<T: Serialize + ?Sized>(&self, file: &Path, value: &T) -> EngineResult<()> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let data = postcard::to_allocvec(value).map_err(|e| EngineError::StorageFormat {
            path: file.to_path_buf(),
            message: e.to_string(),
        })?;
        // atomic replace
        let tmp = file.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp, data).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, file).map_err(io_err(file))
    }

    fn all_templates(&self, identity: &IdentityId) -> EngineResult<Vec<Template>> {
        self.read(&self.identity_path(identity).join(TEMPLATES_FILE))
    }
}

impl TemplateRepository for FileRepository {
    fn save_template(&self, template: &Template) -> EngineResult<()> {
        let lock = self.lock(&template.identity);
        let _guard = lock.lock();
        let mut templates = self.all_templates(&template.identity)?;
        templates.retain(|t| t.id != template.id);
        templates.push(template.clone());
        let file = self.identity_path(&template.identity).join(TEMPLATES_FILE);
        self.write(&file, &templates)
    }

    fn remove_templates(&self, identity: &IdentityId, ids: &[Uuid]) -> EngineResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let lock = self.lock(identity);
        let _guard = lock.lock();
        let mut templates = self.all_templates(identity)?;
        templates.retain(|t| !ids.contains(&t.id));
        let file = self.identity_path(identity).join(TEMPLATES_FILE);
        self.write(&file, &templates)
    }

    fn save_enrollment(&self, record: &EnrollmentRecord) -> EngineResult<()> {
        let lock = self.lock(&record.identity);
        let _guard = lock.lock();
        let file = self.identity_path(&record.identity).join(ENROLLMENT_FILE);
        self.write(&file, &Some(record))
    }

    fn load_templates(
        &self,
        identity: &IdentityId,
        modality: Option<Modality>,
    ) -> EngineResult<Vec<Template>> {
        let mut templates = self.all_templates(identity)?;
        if let Some(modality) = modality {
            templates.retain(|t| t.modality == modality);
        }
        Ok(templates)
    }

    fn load_enrollment(&self, identity: &IdentityId) -> EngineResult<Option<EnrollmentRecord>> {
        self.read(&self.identity_path(identity).join(ENROLLMENT_FILE))
    }

    fn identities(&self) -> EngineResult<Vec<IdentityId>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(IdentityId::new) {
                Some(Ok(id)) => ids.push(id),
                _ => log::warn!("skipping unexpected entry {}", entry.path().display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn purge(&self, identity: &IdentityId) -> EngineResult<()> {
        let lock = self.lock(identity);
        let _guard = lock.lock();
        let path = self.identity_path(identity);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(io_err(&path))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Stored {
    templates: Vec<Template>,
    record: Option<EnrollmentRecord>,
}

/// Volatile repository for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    identities: Mutex<HashMap<IdentityId, Stored>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateRepository for MemoryRepository {
    fn save_template(&self, template: &Template) -> EngineResult<()> {
        let mut identities = self.identities.lock();
        let stored = identities.entry(template.identity.clone()).or_default();
        stored.templates.retain(|t| t.id != template.id);
        stored.templates.push(template.clone());
        Ok(())
    }

    fn remove_templates(&self, identity: &IdentityId, ids: &[Uuid]) -> EngineResult<()> {
        if let Some(stored) = self.identities.lock().get_mut(identity) {
            stored.templates.retain(|t| !ids.contains(&t.id));
        }
        Ok(())
    }

    fn save_enrollment(&self, record: &EnrollmentRecord) -> EngineResult<()> {
        self.identities
            .lock()
            .entry(record.identity.clone())
            .or_default()
            .record = Some(record.clone());
        Ok(())
    }

    fn load_templates(
        &self,
        identity: &IdentityId,
        modality: Option<Modality>,
    ) -> EngineResult<Vec<Template>> {
        Ok(self
            .identities
            .lock()
            .get(identity)
            .map(|s| {
                s.templates
                    .iter()
                    .filter(|t| modality.map_or(true, |m| t.modality == m))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn load_enrollment(&self, identity: &IdentityId) -> EngineResult<Option<EnrollmentRecord>> {
        Ok(self
            .identities
            .lock()
            .get(identity)
            .and_then(|s| s.record.clone()))
    }

    fn identities(&self) -> EngineResult<Vec<IdentityId>> {
        let mut ids: Vec<_> = self.identities.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn purge(&self, identity: &IdentityId) -> EngineResult<()> {
        self.identities.lock().remove(identity);
        Ok(())
    }
}
