//! Manifest Round-Trip Tests
//!
//! serialize -> deserialize -> serialize yields the same document, in every
//! state a stage can be in, and through the session store.

use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use podflow::core::SessionStore;
use podflow::domain::{
    ArtifactKey, Episode, ErrorKind, GateOutcome, Manifest, ManifestError, Participant, Role, StageConfigs,
    StageError, StageId, StageStatus,
};
use tempfile::TempDir;

fn base() -> Manifest {
    let mut manifest = Manifest::new(
        Episode {
            id: Episode::derive_id("Round Trip Radio", 42),
            show: "Round Trip Radio".to_string(),
            title: "Serde All The Way Down".to_string(),
            episode_number: 42,
            recording_date: NaiveDate::from_ymd_opt(2026, 5, 4),
            participants: vec![
                Participant {
                    name: "Grace".to_string(),
                    role: Role::Host,
                    track: PathBuf::from("tracks/grace.wav"),
                },
                Participant {
                    name: "Barbara".to_string(),
                    role: Role::CoHost,
                    track: PathBuf::from("tracks/barbara.wav"),
                },
                Participant {
                    name: "Ken".to_string(),
                    role: Role::Guest,
                    track: PathBuf::from("tracks/ken.wav"),
                },
            ],
        },
        44_100,
    );
    manifest.config.editing.filler_sensitivity = 0.6;
    manifest.config.mastering.mp3 = true;
    manifest
}

/// Every stage status and gate outcome at once
fn busy() -> Manifest {
    let mut manifest = base();
    let at = |h| Utc.with_ymd_and_hms(2026, 5, 4, h, 30, 0).single().unwrap();

    let ingestion = manifest.stage_mut(StageId::Ingestion);
    ingestion.status = StageStatus::Completed;
    ingestion.started_at = Some(at(9));
    ingestion.completed_at = Some(at(10));
    ingestion.gate = GateOutcome::Approved;
    ingestion.gate_decided_at = Some(at(11));
    ingestion.gate_notes = Some("offsets look right".to_string());
    ingestion.last_completed_step = Some("write".to_string());
    ingestion
        .artifact_checksums
        .insert(ArtifactKey::Transcript, "ab".repeat(32));
    ingestion
        .artifact_checksums
        .insert(ArtifactKey::AlignmentMap, "cd".repeat(32));

    let editing = manifest.stage_mut(StageId::Editing);
    editing.status = StageStatus::Failed;
    editing.started_at = Some(at(12));
    editing.last_completed_step = Some("silences".to_string());
    editing.error = Some(StageError {
        kind: ErrorKind::ConsistencyViolation,
        message: "keep operations a and b overlap on track 'Ken'".to_string(),
        step: "validate".to_string(),
    });

    let mixing = manifest.stage_mut(StageId::Mixing);
    mixing.gate = GateOutcome::Rejected;
    mixing.gate_notes = Some("too much ducking".to_string());

    manifest.artifacts.insert(
        ArtifactKey::MasteredMp3,
        PathBuf::from("deliverables/episode-42.mp3"),
    );
    manifest.refresh_current_stage();
    manifest
}

#[test]
fn test_yaml_roundtrip_is_identical() {
    for manifest in [base(), busy()] {
        let first = manifest.to_yaml().unwrap();
        let parsed = Manifest::from_yaml(&first).unwrap();
        let second = parsed.to_yaml().unwrap();

        assert_eq!(parsed, manifest);
        assert_eq!(first, second);
    }
}

#[tokio::test]
async fn test_store_roundtrip_through_transitions() {
    let temp = TempDir::new().unwrap();
    let store = SessionStore::in_dir(temp.path());
    let mut manifest = base();

    store.save(&manifest).unwrap();
    assert_eq!(store.load().await.unwrap(), manifest);

    let transitions: [fn(&mut Manifest); 4] = [
        |m| m.stage_mut(StageId::Ingestion).status = StageStatus::InProgress,
        |m| {
            let r = m.stage_mut(StageId::Ingestion);
            r.status = StageStatus::Completed;
            r.completed_at = Some(Utc::now());
        },
        |m| {
            m.stage_mut(StageId::Ingestion).gate = GateOutcome::Approved;
            m.refresh_current_stage();
        },
        |m| {
            let r = m.stage_mut(StageId::Editing);
            r.status = StageStatus::Failed;
            r.error = Some(StageError {
                kind: ErrorKind::TransientExternal,
                message: "analysis: timed out".to_string(),
                step: "tangents".to_string(),
            });
        },
    ];

    for transition in transitions {
        transition(&mut manifest);
        store.save(&manifest).unwrap();
        assert_eq!(store.load().await.unwrap(), manifest);
    }
}

#[test]
fn test_missing_optional_fields_take_defaults() {
    let yaml = base().to_yaml().unwrap();
    let trimmed: String = yaml
        .split_inclusive('\n')
        .take_while(|line| !line.starts_with("config:"))
        .collect();

    let parsed = Manifest::from_yaml(&trimmed).unwrap();
    assert_eq!(parsed.config, StageConfigs::default());
}

#[test]
fn test_invalid_documents_are_rejected() {
    let mut two_running = base();
    two_running.stage_mut(StageId::Ingestion).status = StageStatus::InProgress;
    two_running.stage_mut(StageId::Editing).status = StageStatus::InProgress;
    let yaml = two_running.to_yaml().unwrap();
    assert!(matches!(Manifest::from_yaml(&yaml), Err(ManifestError::Invalid(_))));

    let mut future = base();
    future.version = 99;
    let yaml = future.to_yaml().unwrap();
    assert!(matches!(
        Manifest::from_yaml(&yaml),
        Err(ManifestError::UnsupportedVersion(99))
    ));

    let mut nobody = base();
    nobody.episode.participants.clear();
    assert!(Manifest::from_yaml(&nobody.to_yaml().unwrap()).is_err());

    assert!(matches!(
        Manifest::from_yaml("episode: [not, a, manifest]"),
        Err(ManifestError::Parse(_))
    ));
}
