use std::sync::Arc;

use anyhow::Result;
use biogate::config::Config;
use biogate::devices::simulated::{card_code, face_pattern, fingerprint_pattern};
use biogate::storage::MemoryRepository;
use biogate::{Decision, Engine, EngineError, Frame, IdentityId, Modality, Payload};

fn face(subject: u64) -> Frame {
    Frame::new("cam-1", 0.9, face_pattern(subject, 0.6)).with_brightness(0.6)
}

fn finger(subject: u64) -> Frame {
    Frame::new(
        "fp-1",
        0.9,
        Payload::Minutiae {
            points: fingerprint_pattern(subject, 40),
        },
    )
}

fn card(subject: u64) -> Frame {
    Frame::new(
        "door-1",
        1.0,
        Payload::Card {
            code: card_code(subject),
        },
    )
}

fn enrolled() -> Result<(Engine, IdentityId)> {
    env_logger::try_init().ok();
    let engine = Engine::builder(Config::default())
        .repository(Arc::new(MemoryRepository::new()))
        .build()?;
    let alice = IdentityId::new("alice")?;
    engine.enroll(&alice, Modality::Face, &face(1))?;
    engine.enroll(&alice, Modality::Fingerprint, &finger(1))?;
    engine.enroll(&alice, Modality::Card, &card(1))?;
    Ok((engine, alice))
}

#[tokio::test]
async fn both_modalities_agree() -> Result<()> {
    let (engine, alice) = enrolled()?;
    let result = engine.authenticate(&alice, vec![face(1), finger(1)], Some(2))?;
    assert_eq!(result.decision, Decision::Authenticated);
    assert_eq!(result.matched, 2);
    assert!(result.confidence > 0.95 && result.confidence <= 1.0);
    Ok(())
}

#[tokio::test]
async fn decision_tracks_required_matches() -> Result<()> {
    let (engine, alice) = enrolled()?;
    // fingerprint from someone else
    let samples = || vec![face(1), finger(2), card(1)];

    for required in 1..=3 {
        let result = engine.authenticate(&alice, samples(), Some(required))?;
        assert_eq!(result.matched, 2);
        let expected = if required <= 2 {
            Decision::Authenticated
        } else {
            Decision::Rejected
        };
        assert_eq!(result.decision, expected, "required {required}");
        assert_eq!(result.per_modality.len(), 3);
    }
    Ok(())
}

#[tokio::test]
async fn single_modality_gets_full_weight() -> Result<()> {
    let (engine, alice) = enrolled()?;
    let result = engine.authenticate(&alice, vec![card(1)], None)?;
    assert_eq!(result.decision, Decision::Authenticated);
    assert_eq!(result.confidence, 1.0);
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() -> Result<()> {
    let (engine, alice) = enrolled()?;

    let err = engine.authenticate(&alice, vec![], None).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .authenticate(&alice, vec![face(1), face(1)], Some(1))
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .authenticate(&alice, vec![face(1), card(1)], Some(3))
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine.authenticate(&alice, vec![card(1)], Some(0)).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let ghost = IdentityId::new("ghost")?;
    let err = engine.authenticate(&ghost, vec![card(1)], None).unwrap_err();
    assert_eq!(err.kind(), "not-found");
    Ok(())
}

#[tokio::test]
async fn other_identity_does_not_count() -> Result<()> {
    let (engine, alice) = enrolled()?;
    let bob = IdentityId::new("bob")?;
    engine.enroll(&bob, Modality::Card, &card(2))?;

    // bob's card presented under alice's claim
    let result = engine.authenticate(&alice, vec![card(2)], None)?;
    assert_eq!(result.decision, Decision::Rejected);
    assert_eq!(result.confidence, 0.0);
    Ok(())
}
