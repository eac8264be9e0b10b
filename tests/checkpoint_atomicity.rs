//! Checkpoint Atomicity Integration Tests
//!
//! A stage's outputs become visible under their final name all at once or
//! not at all, and the manifest only records `completed` after promotion.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use podflow::adapters::{NoopAnalyzer, Providers, SidecarTagWriter, TrackDiarizer, WavEngine, WhisperTranscriber};
use podflow::config::Limits;
use podflow::core::store::checksum_file;
use podflow::core::{Orchestrator, RetryPolicy, RunOutcome, SessionStore, StageFailure};
use podflow::domain::{
    AlignmentMap, AlignmentResult, ArtifactKey, CurrentStage, Episode, ErrorKind, GateDecision, GateOutcome,
    Manifest, Participant, Role, StageId, StageStatus, Transcript,
};
use podflow::stages::{Stage, StageContext};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    /// Writes the first two outputs, then fails
    FailAfterTwo,
    /// Writes the first two outputs and claims success
    ForgetLast,
    Panic,
}

struct ScriptedStage {
    id: StageId,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
}

impl ScriptedStage {
    fn new(id: StageId, behavior: Behavior) -> Self {
        Self {
            id,
            behavior,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Ingestion artifacts the gate report can read
async fn write_ingestion(ctx: &StageContext, key: ArtifactKey) -> Result<(), StageFailure> {
    match key {
        ArtifactKey::Transcript => ctx.write_json(key, &Transcript::default()).await,
        ArtifactKey::AlignmentMap => {
            let map = AlignmentMap {
                reference_track: "host".to_string(),
                sample_rate: ctx.sample_rate(),
                threshold: 0.3,
                tracks: vec![AlignmentResult::reference("host", ctx.sample_rate())],
            };
            ctx.write_json(key, &map).await
        }
        _ => ctx.write_text(key, "partial").await,
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn required_outputs(&self) -> Vec<ArtifactKey> {
        vec![
            ArtifactKey::Transcript,
            ArtifactKey::AlignmentMap,
            ArtifactKey::ContextDocument,
        ]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        ctx.begin("transcribe");
        write_ingestion(ctx, ArtifactKey::Transcript).await?;
        ctx.begin("align");
        write_ingestion(ctx, ArtifactKey::AlignmentMap).await?;
        ctx.begin("context");

        match self.behavior {
            Behavior::Succeed => {
                ctx.write_json(ArtifactKey::ContextDocument, &serde_json::json!({
                    "topics": [],
                    "segments": [],
                    "key_quotes": []
                }))
                .await?;
                ctx.finish();
                Ok(())
            }
            Behavior::FailAfterTwo => Err(ctx.invalid("analysis returned garbage")),
            Behavior::ForgetLast => Ok(()),
            Behavior::Panic => panic!("analyzer bug"),
        }
    }
}

fn manifest() -> Manifest {
    Manifest::new(
        Episode {
            id: Episode::derive_id("Atomic Hour", 1),
            show: "Atomic Hour".to_string(),
            title: "All Or Nothing".to_string(),
            episode_number: 1,
            recording_date: None,
            participants: vec![Participant {
                name: "host".to_string(),
                role: Role::Host,
                track: "tracks/host.wav".into(),
            }],
        },
        48_000,
    )
}

fn providers() -> Providers {
    Providers {
        transcriber: Arc::new(WhisperTranscriber::with_binary_path("whisper")),
        diarizer: Arc::new(TrackDiarizer),
        analyzer: Arc::new(NoopAnalyzer),
        engine: Arc::new(WavEngine::new()),
        tags: Arc::new(SidecarTagWriter),
    }
}

fn orchestrator(dir: &Path, ingestion: ScriptedStage) -> Orchestrator {
    let limits = Limits {
        min_free_disk_mb: 0,
        ..Limits::default()
    };
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ingestion),
        Arc::new(ScriptedStage::new(StageId::Editing, Behavior::FailAfterTwo)),
        Arc::new(ScriptedStage::new(StageId::Mixing, Behavior::FailAfterTwo)),
        Arc::new(ScriptedStage::new(StageId::Mastering, Behavior::FailAfterTwo)),
    ];
    Orchestrator::new(SessionStore::in_dir(dir), providers(), RetryPolicy::default(), limits).with_stages(stages)
}

/// Names under artifacts/ (staging and trash included)
fn artifact_entries(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir.join("artifacts")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn setup() -> (TempDir, Manifest) {
    let temp = TempDir::new().unwrap();
    let manifest = manifest();
    SessionStore::in_dir(temp.path()).save(&manifest).unwrap();
    (temp, manifest)
}

#[tokio::test]
async fn test_failure_after_partial_writes_promotes_nothing() {
    let (temp, mut manifest) = setup();
    let orch = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::FailAfterTwo));

    let outcome = orch.run(&mut manifest).await.unwrap();
    let RunOutcome::Failed { stage, error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(stage, StageId::Ingestion);
    assert_eq!(error.kind, ErrorKind::InputValidation);
    assert_eq!(error.step, "context");

    // Neither a final directory nor a leftover staging directory
    assert!(artifact_entries(temp.path()).is_empty());

    let persisted = SessionStore::in_dir(temp.path()).load().await.unwrap();
    let record = persisted.stage(StageId::Ingestion);
    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.artifact_checksums.is_empty());
    assert!(record.completed_at.is_none());
    assert_eq!(record.last_completed_step.as_deref(), Some("align"));
    assert_eq!(record.error.as_ref().unwrap().message, "analysis returned garbage");
    assert_eq!(persisted.current_stage, CurrentStage::Ingestion);
}

#[tokio::test]
async fn test_missing_required_output_fails_checkpoint() {
    let (temp, mut manifest) = setup();
    let orch = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::ForgetLast));

    let outcome = orch.run(&mut manifest).await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(error.kind, ErrorKind::ConsistencyViolation);
    assert_eq!(error.step, "checkpoint");
    assert!(error.message.contains("context.json"));

    assert!(artifact_entries(temp.path()).is_empty());
    assert_eq!(manifest.stage(StageId::Ingestion).status, StageStatus::Failed);
}

#[tokio::test]
async fn test_panicking_stage_is_recorded_as_failure() {
    let (temp, mut manifest) = setup();
    let orch = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::Panic));

    let outcome = orch.run(&mut manifest).await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(error.kind, ErrorKind::ConsistencyViolation);
    assert!(artifact_entries(temp.path()).is_empty());

    let persisted = SessionStore::in_dir(temp.path()).load().await.unwrap();
    assert_eq!(persisted.stage(StageId::Ingestion).status, StageStatus::Failed);
}

#[tokio::test]
async fn test_rerun_after_failure_checkpoints_everything() {
    let (temp, mut manifest) = setup();
    let failing = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::FailAfterTwo));
    failing.run(&mut manifest).await.unwrap();

    let orch = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::Succeed));
    let outcome = orch.run(&mut manifest).await.unwrap();
    let RunOutcome::AwaitingGate(report) = outcome else {
        panic!("expected gate, got {:?}", outcome);
    };
    assert_eq!(report.stage, StageId::Ingestion);

    assert_eq!(artifact_entries(temp.path()), vec!["ingestion".to_string()]);

    let persisted = SessionStore::in_dir(temp.path()).load().await.unwrap();
    let record = persisted.stage(StageId::Ingestion);
    assert_eq!(record.status, StageStatus::Completed);
    assert_eq!(record.gate, GateOutcome::Unset);
    assert!(record.error.is_none());
    assert_eq!(record.last_completed_step.as_deref(), Some("context"));
    assert_eq!(record.artifact_checksums.len(), 3);
    for (key, digest) in &record.artifact_checksums {
        let path = temp.path().join(persisted.artifact_path(*key));
        assert_eq!(&checksum_file(&path).unwrap(), digest);
    }
}

#[tokio::test]
async fn test_interrupted_stage_runs_again() {
    let (temp, mut manifest) = setup();

    // A process died mid-stage: record in_progress, staging left behind
    manifest.stage_mut(StageId::Ingestion).status = StageStatus::InProgress;
    let store = SessionStore::in_dir(temp.path());
    store.save(&manifest).unwrap();
    let stale = temp.path().join("artifacts/.staging-ingestion-0000");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("transcript.json"), "{").unwrap();

    let orch = orchestrator(temp.path(), ScriptedStage::new(StageId::Ingestion, Behavior::Succeed));
    let outcome = orch.run(&mut manifest).await.unwrap();

    assert!(matches!(outcome, RunOutcome::AwaitingGate(_)));
    assert!(!stale.exists());
    assert_eq!(artifact_entries(temp.path()), vec!["ingestion".to_string()]);
    assert_eq!(manifest.stage(StageId::Ingestion).status, StageStatus::Completed);
}

#[tokio::test]
async fn test_approved_stage_is_never_rerun() {
    let (temp, mut manifest) = setup();
    let ingestion = ScriptedStage::new(StageId::Ingestion, Behavior::Succeed);
    let runs = ingestion.runs.clone();
    let orch = orchestrator(temp.path(), ingestion);

    orch.run(&mut manifest).await.unwrap();
    // Waiting at the gate: running again presents it, nothing executes
    orch.run(&mut manifest).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    orch.apply_gate_decision(&mut manifest, &GateDecision::approve(StageId::Ingestion))
        .await
        .unwrap();

    let outcome = orch.run(&mut manifest).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { stage: StageId::Editing, .. }));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let persisted = SessionStore::in_dir(temp.path()).load().await.unwrap();
    assert!(persisted.stage(StageId::Ingestion).is_approved());
    assert_eq!(persisted.stage(StageId::Editing).status, StageStatus::Failed);
    assert_eq!(persisted.current_stage, CurrentStage::Editing);
    assert!(temp.path().join("artifacts/ingestion").exists());
    assert!(!temp.path().join("artifacts/editing").exists());
}
