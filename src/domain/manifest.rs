//! The session manifest.
//!
//! One YAML document per episode holds everything needed to resume the
//! pipeline: episode identity, one record per stage, the current-stage
//! pointer, the artifact path registry and the per-session tuning.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::settings::StageConfigs;

/// Schema version written by this build
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the manifest inside a session directory
pub const MANIFEST_FILE: &str = "manifest.yaml";

/// Errors raised while reading or validating a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unsupported manifest version {0} (expected {MANIFEST_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// The four pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingestion,
    Editing,
    Mixing,
    Mastering,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Ingestion,
        StageId::Editing,
        StageId::Mixing,
        StageId::Mastering,
    ];

    pub fn index(self) -> usize {
        match self {
            StageId::Ingestion => 0,
            StageId::Editing => 1,
            StageId::Mixing => 2,
            StageId::Mastering => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Ingestion => "ingestion",
            StageId::Editing => "editing",
            StageId::Mixing => "mixing",
            StageId::Mastering => "mastering",
        }
    }

    pub fn next(self) -> Option<StageId> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// This stage and every stage after it
    pub fn and_later(self) -> impl Iterator<Item = StageId> {
        Self::ALL.into_iter().skip(self.index())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ingestion" | "ingest" => Ok(StageId::Ingestion),
            "editing" | "edit" => Ok(StageId::Editing),
            "mixing" | "mix" => Ok(StageId::Mixing),
            "mastering" | "master" => Ok(StageId::Mastering),
            other => Err(format!(
                "Unknown stage '{}' (expected ingestion, editing, mixing or mastering)",
                other
            )),
        }
    }
}

/// Global pipeline pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentStage {
    Ingestion,
    Editing,
    Mixing,
    Mastering,
    Complete,
}

impl CurrentStage {
    pub fn stage(self) -> Option<StageId> {
        match self {
            CurrentStage::Ingestion => Some(StageId::Ingestion),
            CurrentStage::Editing => Some(StageId::Editing),
            CurrentStage::Mixing => Some(StageId::Mixing),
            CurrentStage::Mastering => Some(StageId::Mastering),
            CurrentStage::Complete => None,
        }
    }

    /// Position in stage order (4 for `complete`)
    pub fn index(self) -> usize {
        self.stage().map(StageId::index).unwrap_or(StageId::ALL.len())
    }
}

impl From<StageId> for CurrentStage {
    fn from(stage: StageId) -> Self {
        match stage {
            StageId::Ingestion => CurrentStage::Ingestion,
            StageId::Editing => CurrentStage::Editing,
            StageId::Mixing => CurrentStage::Mixing,
            StageId::Mastering => CurrentStage::Mastering,
        }
    }
}

impl fmt::Display for CurrentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage() {
            Some(stage) => stage.fmt(f),
            None => f.write_str("complete"),
        }
    }
}

/// Execution status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Human gate outcome recorded on a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    #[default]
    Unset,
    Approved,
    Rejected,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateOutcome::Unset => "unset",
            GateOutcome::Approved => "approved",
            GateOutcome::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed input; never retried
    InputValidation,
    /// Timeout or rate limit from a collaborator after retries ran out
    TransientExternal,
    /// A result too uncertain to accept without review
    LowConfidenceResult,
    /// Disk full or out of memory
    ResourceExhaustion,
    /// Internally inconsistent data, never auto-corrected
    ConsistencyViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InputValidation => "input_validation",
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::LowConfidenceResult => "low_confidence_result",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::ConsistencyViolation => "consistency_violation",
        };
        f.write_str(s)
    }
}

/// Diagnosable cause of a failed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Step within the stage that failed
    pub step: String,
}

/// Persisted state of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,

    pub status: StageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub gate: GateOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_decided_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_notes: Option<String>,

    /// Populated only while status is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,

    /// Last step that finished during the most recent execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<String>,

    /// SHA-256 of every artifact checkpointed by this stage
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_checksums: BTreeMap<ArtifactKey, String>,
}

impl StageRecord {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            gate: GateOutcome::Unset,
            gate_decided_at: None,
            gate_notes: None,
            error: None,
            last_completed_step: None,
            artifact_checksums: BTreeMap::new(),
        }
    }

    /// Return to the unexecuted state. Gate fields are cleared too; callers
    /// that need to keep a rejection note set it again afterwards.
    pub fn reset(&mut self) {
        *self = Self::new(self.stage);
    }

    /// Completed but not yet decided by a human
    pub fn awaiting_gate(&self) -> bool {
        self.status == StageStatus::Completed && self.gate == GateOutcome::Unset
    }

    pub fn is_approved(&self) -> bool {
        self.status == StageStatus::Completed && self.gate == GateOutcome::Approved
    }
}

/// Role a participant plays in the episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Host,
    CoHost,
    Guest,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "co-host" | "cohost" | "co_host" => Ok(Role::CoHost),
            "guest" => Ok(Role::Guest),
            other => Err(format!("Unknown role '{}' (expected host, co-host or guest)", other)),
        }
    }
}

/// One recorded speaker and their isolated track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub role: Role,
    /// Track path relative to the session directory
    pub track: PathBuf,
}

/// Episode identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Derived id: `<show-slug>-ep<N>`
    pub id: String,
    pub show: String,
    pub title: String,
    pub episode_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_date: Option<NaiveDate>,
    pub participants: Vec<Participant>,
}

impl Episode {
    pub fn derive_id(show: &str, episode_number: u32) -> String {
        format!("{}-ep{}", slugify(show), episode_number)
    }

    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    /// The first participant with the host role
    pub fn host(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.role == Role::Host)
    }
}

/// Lowercase, ascii-alphanumeric words joined by '-'
pub fn slugify(s: &str) -> String {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// Logical names of every artifact the pipeline produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKey {
    Transcript,
    AlignmentMap,
    ContextDocument,
    Edl,
    EdlSidecar,
    EditRationale,
    ContentSummary,
    MixedAudio,
    MixingLog,
    MasteredWav,
    MasteredMp3,
    ShowNotes,
    Metadata,
}

impl ArtifactKey {
    pub const ALL: [ArtifactKey; 13] = [
        ArtifactKey::Transcript,
        ArtifactKey::AlignmentMap,
        ArtifactKey::ContextDocument,
        ArtifactKey::Edl,
        ArtifactKey::EdlSidecar,
        ArtifactKey::EditRationale,
        ArtifactKey::ContentSummary,
        ArtifactKey::MixedAudio,
        ArtifactKey::MixingLog,
        ArtifactKey::MasteredWav,
        ArtifactKey::MasteredMp3,
        ArtifactKey::ShowNotes,
        ArtifactKey::Metadata,
    ];

    /// Stage that produces this artifact
    pub fn stage(self) -> StageId {
        match self {
            ArtifactKey::Transcript | ArtifactKey::AlignmentMap | ArtifactKey::ContextDocument => {
                StageId::Ingestion
            }
            ArtifactKey::Edl
            | ArtifactKey::EdlSidecar
            | ArtifactKey::EditRationale
            | ArtifactKey::ContentSummary => StageId::Editing,
            ArtifactKey::MixedAudio | ArtifactKey::MixingLog => StageId::Mixing,
            ArtifactKey::MasteredWav
            | ArtifactKey::MasteredMp3
            | ArtifactKey::ShowNotes
            | ArtifactKey::Metadata => StageId::Mastering,
        }
    }

    /// File name inside the producing stage's directory
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKey::Transcript => "transcript.json",
            ArtifactKey::AlignmentMap => "alignment.json",
            ArtifactKey::ContextDocument => "context.json",
            ArtifactKey::Edl => "edit-list.edl",
            ArtifactKey::EdlSidecar => "edit-list.json",
            ArtifactKey::EditRationale => "rationale.json",
            ArtifactKey::ContentSummary => "summary.md",
            ArtifactKey::MixedAudio => "mixed.wav",
            ArtifactKey::MixingLog => "mixing-log.json",
            ArtifactKey::MasteredWav => "mastered.wav",
            ArtifactKey::MasteredMp3 => "mastered.mp3",
            ArtifactKey::ShowNotes => "show-notes.md",
            ArtifactKey::Metadata => "metadata.json",
        }
    }

    /// Artifacts a stage may produce, in registry order
    pub fn for_stage(stage: StageId) -> impl Iterator<Item = ArtifactKey> {
        Self::ALL.into_iter().filter(move |k| k.stage() == stage)
    }

    /// Default project-relative path
    pub fn default_path(self) -> PathBuf {
        PathBuf::from(ARTIFACTS_DIR)
            .join(self.stage().as_str())
            .join(self.file_name())
    }
}

/// Root of all stage output directories, relative to the session
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Root of the participant tracks, relative to the session
pub const TRACKS_DIR: &str = "tracks";

/// Persisted session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,

    pub episode: Episode,

    /// Session sample rate; every tick in every artifact uses it
    pub sample_rate: u32,

    pub current_stage: CurrentStage,

    pub stages: Vec<StageRecord>,

    /// Logical artifact name -> project-relative path
    pub artifacts: BTreeMap<ArtifactKey, PathBuf>,

    #[serde(default)]
    pub config: StageConfigs,
}

impl Manifest {
    pub fn new(episode: Episode, sample_rate: u32) -> Self {
        Self {
            version: MANIFEST_VERSION,
            episode,
            sample_rate,
            current_stage: CurrentStage::Ingestion,
            stages: StageId::ALL.into_iter().map(StageRecord::new).collect(),
            artifacts: ArtifactKey::ALL
                .into_iter()
                .map(|k| (k, k.default_path()))
                .collect(),
            config: StageConfigs::default(),
        }
    }

    /// Stage record by id. `validate` guarantees one record per stage in order.
    pub fn stage(&self, id: StageId) -> &StageRecord {
        &self.stages[id.index()]
    }

    pub fn stage_mut(&mut self, id: StageId) -> &mut StageRecord {
        &mut self.stages[id.index()]
    }

    /// Registered path for an artifact, relative to the session directory
    pub fn artifact_path(&self, key: ArtifactKey) -> PathBuf {
        self.artifacts
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.default_path())
    }

    /// First stage that has completed and waits for a human decision
    pub fn pending_gate(&self) -> Option<StageId> {
        self.stages
            .iter()
            .find(|r| r.awaiting_gate())
            .map(|r| r.stage)
    }

    /// Point `current_stage` at the first stage not yet completed and approved
    pub fn refresh_current_stage(&mut self) {
        self.current_stage = self
            .stages
            .iter()
            .find(|r| !r.is_approved())
            .map(|r| CurrentStage::from(r.stage))
            .unwrap_or(CurrentStage::Complete);
    }

    pub fn is_complete(&self) -> bool {
        self.current_stage == CurrentStage::Complete
    }

    /// Check the structural invariants of the document
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version));
        }

        if self.sample_rate == 0 {
            return Err(ManifestError::Invalid("sample_rate must be positive".into()));
        }

        if self.episode.participants.is_empty() {
            return Err(ManifestError::Invalid("episode has no participants".into()));
        }

        for (i, p) in self.episode.participants.iter().enumerate() {
            if self.episode.participants[..i].iter().any(|q| q.name == p.name) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate participant name '{}'",
                    p.name
                )));
            }
        }

        let order: Vec<StageId> = self.stages.iter().map(|r| r.stage).collect();
        if order != StageId::ALL {
            return Err(ManifestError::Invalid(format!(
                "stages must be listed once each in order, found {:?}",
                order
            )));
        }

        let running = self
            .stages
            .iter()
            .filter(|r| r.status == StageStatus::InProgress)
            .count();
        if running > 1 {
            return Err(ManifestError::Invalid(format!(
                "{} stages are in_progress, at most one is allowed",
                running
            )));
        }

        for record in &self.stages {
            if record.status == StageStatus::Failed && record.error.is_none() {
                return Err(ManifestError::Invalid(format!(
                    "stage {} is failed without an error record",
                    record.stage
                )));
            }
        }

        for record in &self.stages[..self.current_stage.index()] {
            if !record.is_approved() {
                return Err(ManifestError::Invalid(format!(
                    "stage {} precedes current stage {} but is {}/{}",
                    record.stage, self.current_stage, record.status, record.gate
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate
    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
