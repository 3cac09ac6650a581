use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use biogate::config::Config;
use biogate::devices::simulated::face_pattern;
use biogate::storage::{FileRepository, MemoryRepository, TemplateRepository};
use biogate::store::{EnrollmentRecord, TemplateStore};
use biogate::{
    Engine, EngineError, EngineResult, EnrollOutcome, Features, Frame, IdentityId, Modality,
    Payload, Stage, Template,
};
use ndarray::array;
use parking_lot::Mutex;
use uuid::Uuid;

#[test]
fn templates_round_trip_through_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::new(dir.path());
    let alice = IdentityId::new("alice")?;

    let store = TemplateStore::default();
    let face = store.insert(&alice, Features::Vector(array![0.6, 0.8]), 0.9, true);
    let card = store.insert(&alice, Features::Card("CARD-1".into()), 1.0, true);
    repo.save_template(&face.template)?;
    repo.save_template(&card.template)?;
    repo.save_enrollment(&card.record)?;

    assert_eq!(repo.identities()?, vec![alice.clone()]);
    let all = repo.load_templates(&alice, None)?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0], face.template);

    let cards = repo.load_templates(&alice, Some(Modality::Card))?;
    assert_eq!(cards, vec![card.template.clone()]);
    assert_eq!(repo.load_enrollment(&alice)?, Some(card.record));

    repo.remove_templates(&alice, &[face.template.id])?;
    assert_eq!(repo.load_templates(&alice, None)?.len(), 1);
    Ok(())
}

#[test]
fn missing_identity_loads_empty() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::new(dir.path().join("not-yet-created"));
    let bob = IdentityId::new("bob")?;
    assert!(repo.load_templates(&bob, None)?.is_empty());
    assert!(repo.load_enrollment(&bob)?.is_none());
    assert!(repo.identities()?.is_empty());
    repo.purge(&bob)?;
    Ok(())
}

#[test]
fn corrupt_files_are_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("carol"))?;
    std::fs::write(dir.path().join("carol/templates.bin"), [0xff, 0xff, 0xff])?;
    let repo = FileRepository::new(dir.path());
    let err = repo
        .load_templates(&IdentityId::new("carol")?, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageFormat { .. }));
    assert_eq!(err.kind(), "storage");
    Ok(())
}

#[tokio::test]
async fn engine_restores_enrollments_on_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let alice = IdentityId::new("alice")?;
    let sample = Frame::new("cam-1", 0.9, face_pattern(4, 0.6)).with_brightness(0.6);

    {
        let engine = Engine::builder(Config::default())
            .repository(Arc::new(FileRepository::new(dir.path())))
            .build()?;
        engine.enroll(&alice, Modality::Face, &sample)?;
    }

    let engine = Engine::builder(Config::default())
        .repository(Arc::new(FileRepository::new(dir.path())))
        .build()?;
    assert_eq!(engine.identities(), vec![alice.clone()]);
    assert!(engine.enrollment(&alice)?.is_active());
    let outcome = engine.identify(sample)?;
    assert_eq!(outcome.stage, Stage::Identified);

    // a second version continues after the restored one
    let outcome = engine.enroll(&alice, Modality::Face, &Frame::new("cam-1", 0.9, face_pattern(4, 0.7)).with_brightness(0.7))?;
    assert!(matches!(outcome, EnrollOutcome::Enrolled { version: 2, .. }));

    engine.purge_identity(&alice)?;
    assert!(!dir.path().join("alice").exists());
    Ok(())
}

#[test]
fn concurrent_saves_for_one_identity_keep_every_template() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::new(dir.path());
    let alice = IdentityId::new("alice")?;
    let store = TemplateStore::default();
    let templates: Vec<_> = (0..16)
        .map(|n| store.insert(&alice, Features::Card(format!("CARD-{n}")), 1.0, true).template)
        .collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let writers: Vec<_> = templates
            .iter()
            .map(|template| {
                let repo = repo.clone();
                s.spawn(move || repo.save_template(template))
            })
            .collect();
        writers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    for result in results {
        result?;
    }

    let mut on_disk = repo.load_templates(&alice, None)?;
    on_disk.sort_by_key(|t| t.sequence);
    assert_eq!(on_disk, templates);
    let leftovers = std::fs::read_dir(dir.path().join("alice"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enrollments_for_one_identity_are_all_persisted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(
        Engine::builder(Config::default())
            .repository(Arc::new(FileRepository::new(dir.path())))
            .build()?,
    );
    let alice = IdentityId::new("alice")?;

    let mut jobs = Vec::new();
    for n in 0..8u64 {
        let engine = engine.clone();
        let alice = alice.clone();
        jobs.push(tokio::task::spawn_blocking(move || {
            let card = Frame::new("door-1", 1.0, Payload::Card { code: format!("CARD-{n}") });
            engine.enroll(&alice, Modality::Card, &card)
        }));
    }
    let mut versions = Vec::new();
    for job in jobs {
        match job.await?? {
            EnrollOutcome::Enrolled { version, .. } => versions.push(version),
            EnrollOutcome::Rejected { quality } => panic!("rejected: {:?}", quality.reasons),
        }
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=8).collect::<Vec<_>>());

    let repo = FileRepository::new(dir.path());
    assert_eq!(repo.load_templates(&alice, None)?.len(), 8);
    assert_eq!(repo.load_enrollment(&alice)?.map(|r| r.templates.len()), Some(8));
    assert_eq!(engine.enrollment(&alice)?.templates.len(), 8);
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Fault {
    None,
    Templates,
    Enrollment,
}

/// In-memory repository that refuses one kind of write on demand.
struct FlakyRepository {
    inner: MemoryRepository,
    fault: Mutex<Fault>,
}

impl FlakyRepository {
    fn refuse(&self, what: Fault) -> EngineResult<()> {
        if *self.fault.lock() == what {
            return Err(EngineError::StorageIo {
                path: PathBuf::from("flaky"),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        Ok(())
    }
}

impl TemplateRepository for FlakyRepository {
    fn save_template(&self, template: &Template) -> EngineResult<()> {
        self.refuse(Fault::Templates)?;
        self.inner.save_template(template)
    }

    fn remove_templates(&self, identity: &IdentityId, ids: &[Uuid]) -> EngineResult<()> {
        self.inner.remove_templates(identity, ids)
    }

    fn save_enrollment(&self, record: &EnrollmentRecord) -> EngineResult<()> {
        self.refuse(Fault::Enrollment)?;
        self.inner.save_enrollment(record)
    }

    fn load_templates(&self, identity: &IdentityId, modality: Option<Modality>) -> EngineResult<Vec<Template>> {
        self.inner.load_templates(identity, modality)
    }

    fn load_enrollment(&self, identity: &IdentityId) -> EngineResult<Option<EnrollmentRecord>> {
        self.inner.load_enrollment(identity)
    }

    fn identities(&self) -> EngineResult<Vec<IdentityId>> {
        self.inner.identities()
    }

    fn purge(&self, identity: &IdentityId) -> EngineResult<()> {
        self.inner.purge(identity)
    }
}

#[tokio::test]
async fn failed_writes_leave_memory_and_disk_in_step() -> Result<()> {
    let repo = Arc::new(FlakyRepository {
        inner: MemoryRepository::new(),
        fault: Mutex::new(Fault::None),
    });
    let engine = Engine::builder(Config::default())
        .repository(repo.clone())
        .build()?;
    let alice = IdentityId::new("alice")?;
    let card = |code: &str| Frame::new("door-1", 1.0, Payload::Card { code: code.into() });
    engine.enroll(&alice, Modality::Card, &card("A-1"))?;

    *repo.fault.lock() = Fault::Enrollment;
    let err = engine.enroll(&alice, Modality::Card, &card("A-2")).unwrap_err();
    assert_eq!(err.kind(), "storage");
    assert_eq!(repo.load_templates(&alice, None)?.len(), 1);
    assert_eq!(engine.enrollment(&alice)?.templates.len(), 1);
    assert_eq!(engine.identify(card("A-2"))?.stage, Stage::Unidentified);

    let bob = IdentityId::new("bob")?;
    *repo.fault.lock() = Fault::Templates;
    assert!(engine.enroll(&bob, Modality::Card, &card("B-1")).is_err());
    assert_eq!(engine.identities(), vec![alice.clone()]);

    *repo.fault.lock() = Fault::None;
    let outcome = engine.enroll(&alice, Modality::Card, &card("A-2"))?;
    assert!(matches!(outcome, EnrollOutcome::Enrolled { version: 2, .. }));
    Ok(())
}
