//! Gate Rejection Integration Tests
//!
//! Rejecting at stage N rewinds N..end to pending and discards their
//! artifacts, while stages before the target stay completed and approved.

use std::path::{Path, PathBuf};

use chrono::Utc;
use podflow::core::{GateController, GateEffect, GateError, SessionStore};
use podflow::domain::{
    ArtifactKey, CurrentStage, Episode, GateDecision, GateOutcome, Manifest, Participant, Role, StageId,
    StageStatus,
};
use tempfile::TempDir;

fn manifest() -> Manifest {
    Manifest::new(
        Episode {
            id: Episode::derive_id("Gate Show", 3),
            show: "Gate Show".to_string(),
            title: "Rewind".to_string(),
            episode_number: 3,
            recording_date: None,
            participants: vec![
                Participant {
                    name: "host".to_string(),
                    role: Role::Host,
                    track: PathBuf::from("tracks/host.wav"),
                },
                Participant {
                    name: "guest".to_string(),
                    role: Role::Guest,
                    track: PathBuf::from("tracks/guest.wav"),
                },
            ],
        },
        48_000,
    )
}

/// A session where every stage before `at` is approved and `at` waits at
/// its gate, with one output file per finished stage
fn session_at(dir: &Path, at: StageId) -> (SessionStore, Manifest) {
    let store = SessionStore::in_dir(dir);
    let mut manifest = manifest();

    for stage in StageId::ALL.into_iter().take(at.index() + 1) {
        let stage_dir = store.stage_dir(stage);
        std::fs::create_dir_all(&stage_dir).unwrap();
        let key = ArtifactKey::for_stage(stage).next().unwrap();
        std::fs::write(stage_dir.join(key.file_name()), stage.as_str()).unwrap();

        let record = manifest.stage_mut(stage);
        record.status = StageStatus::Completed;
        record.started_at = Some(Utc::now());
        record.completed_at = Some(Utc::now());
        record.artifact_checksums.insert(key, "00".repeat(32));
        if stage != at {
            record.gate = GateOutcome::Approved;
            record.gate_decided_at = Some(Utc::now());
        }
    }
    manifest.refresh_current_stage();
    store.save(&manifest).unwrap();
    (store, manifest)
}

fn assert_rewound(store: &SessionStore, manifest: &Manifest, target: StageId) {
    for stage in StageId::ALL {
        let record = manifest.stage(stage);
        if stage < target {
            assert!(record.is_approved(), "{} should stay approved", stage);
            assert!(store.stage_dir(stage).exists(), "{} outputs should stay", stage);
        } else {
            assert_eq!(record.status, StageStatus::Pending, "{}", stage);
            assert!(record.artifact_checksums.is_empty());
            assert!(record.completed_at.is_none());
            assert!(!store.stage_dir(stage).exists(), "{} outputs should be gone", stage);
        }
    }
    assert_eq!(manifest.stage(target).gate, GateOutcome::Rejected);
    assert_eq!(manifest.current_stage, CurrentStage::from(target));
}

#[tokio::test]
async fn test_reject_at_every_stage() {
    for at in StageId::ALL {
        let temp = TempDir::new().unwrap();
        let (store, mut manifest) = session_at(temp.path(), at);

        let effect = GateController::new(store.clone())
            .apply(&mut manifest, &GateDecision::reject(at, None).with_notes("redo"))
            .await
            .unwrap();

        assert_eq!(effect, GateEffect::Applied);
        assert_rewound(&store, &manifest, at);
        assert_eq!(manifest.stage(at).gate_notes.as_deref(), Some("redo"));

        // What is on disk matches what the controller returned
        let persisted = store.load().await.unwrap();
        assert_eq!(persisted, manifest);
    }
}

#[tokio::test]
async fn test_reject_back_to_earlier_stage() {
    let temp = TempDir::new().unwrap();
    let (store, mut manifest) = session_at(temp.path(), StageId::Mixing);

    GateController::new(store.clone())
        .apply(
            &mut manifest,
            &GateDecision::reject(StageId::Mixing, Some(StageId::Editing)),
        )
        .await
        .unwrap();

    assert_rewound(&store, &manifest, StageId::Editing);
    assert_eq!(manifest.stage(StageId::Mixing).gate, GateOutcome::Unset);
}

#[tokio::test]
async fn test_reject_twice_is_no_change() {
    let temp = TempDir::new().unwrap();
    let (store, mut manifest) = session_at(temp.path(), StageId::Editing);
    let gates = GateController::new(store.clone());
    let decision = GateDecision::reject(StageId::Editing, None);

    assert_eq!(gates.apply(&mut manifest, &decision).await.unwrap(), GateEffect::Applied);
    let after_first = store.load().await.unwrap();

    assert_eq!(gates.apply(&mut manifest, &decision).await.unwrap(), GateEffect::NoChange);
    assert_eq!(store.load().await.unwrap(), after_first);
}

#[tokio::test]
async fn test_reject_forward_target_is_illegal() {
    let temp = TempDir::new().unwrap();
    let (store, mut manifest) = session_at(temp.path(), StageId::Editing);
    let before = manifest.clone();

    let err = GateController::new(store.clone())
        .apply(
            &mut manifest,
            &GateDecision::reject(StageId::Editing, Some(StageId::Mastering)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GateError::IllegalTarget { .. }));
    assert_eq!(manifest, before);
    assert!(store.stage_dir(StageId::Editing).exists());
}

#[tokio::test]
async fn test_approve_advances_current_stage() {
    let temp = TempDir::new().unwrap();
    let (store, mut manifest) = session_at(temp.path(), StageId::Ingestion);
    let gates = GateController::new(store.clone());

    gates
        .apply(&mut manifest, &GateDecision::approve(StageId::Ingestion))
        .await
        .unwrap();
    assert!(manifest.stage(StageId::Ingestion).is_approved());
    assert_eq!(manifest.current_stage, CurrentStage::Editing);

    // Nothing is waiting at editing yet
    let err = gates
        .apply(&mut manifest, &GateDecision::approve(StageId::Editing))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::NotAwaiting { .. }));
}
