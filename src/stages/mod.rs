//! The four pipeline stages.
//!
//! A stage reads promoted artifacts of earlier stages, writes its own
//! outputs into a staging directory and reports a classified
//! [`StageFailure`] on error. Checkpointing, retries at the stage level and
//! manifest updates belong to the orchestrator, never to a stage.

pub mod editing;
pub mod ingestion;
pub mod mastering;
pub mod mixing;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::adapters::{ProviderError, Providers};
use crate::config::Limits;
use crate::core::error::{AtStep, StageFailure};
use crate::core::retry::{call_with_retry, CallLimits, RetryPolicy};
use crate::core::store::write_atomic;
use crate::domain::manifest::{ArtifactKey, Manifest, Participant, StageId};

pub use editing::EditingStage;
pub use ingestion::IngestionStage;
pub use mastering::MasteringStage;
pub use mixing::MixingStage;

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Artifacts that must exist in staging for the stage to checkpoint
    fn required_outputs(&self) -> Vec<ArtifactKey>;

    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure>;
}

/// The production stage set, in pipeline order
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(IngestionStage),
        Arc::new(EditingStage),
        Arc::new(MixingStage),
        Arc::new(MasteringStage),
    ]
}

/// Everything a stage may touch during one execution.
///
/// `manifest` is a snapshot; changes to it are never persisted.
pub struct StageContext {
    pub session_dir: PathBuf,
    pub manifest: Manifest,
    pub staging: PathBuf,
    pub providers: Providers,
    pub retry: RetryPolicy,
    pub limits: Limits,
    step: String,
    last_completed_step: Option<String>,
}

impl StageContext {
    pub fn new(
        session_dir: PathBuf,
        manifest: Manifest,
        staging: PathBuf,
        providers: Providers,
        retry: RetryPolicy,
        limits: Limits,
    ) -> Self {
        Self {
            session_dir,
            manifest,
            staging,
            providers,
            retry,
            limits,
            step: "start".to_string(),
            last_completed_step: None,
        }
    }

    /// Enter the next step; the previous one counts as completed
    pub fn begin(&mut self, step: &str) {
        if self.step != "start" {
            self.last_completed_step = Some(std::mem::replace(&mut self.step, step.to_string()));
        } else {
            self.step = step.to_string();
        }
        debug!(step, "Step started");
    }

    /// Mark the current step completed without entering another
    pub fn finish(&mut self) {
        self.last_completed_step = Some(self.step.clone());
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn last_completed_step(&self) -> Option<&str> {
        self.last_completed_step.as_deref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.manifest.sample_rate
    }

    /// Promoted artifact of an earlier stage
    pub fn input_path(&self, key: ArtifactKey) -> PathBuf {
        self.session_dir.join(self.manifest.artifact_path(key))
    }

    /// Where this stage writes `key`
    pub fn output_path(&self, key: ArtifactKey) -> PathBuf {
        self.staging.join(key.file_name())
    }

    pub fn track_path(&self, participant: &Participant) -> PathBuf {
        self.session_dir.join(&participant.track)
    }

    pub fn failure(&self, message: impl Into<String>) -> StageFailure {
        StageFailure::consistency(self.step.clone(), message)
    }

    pub fn invalid(&self, message: impl Into<String>) -> StageFailure {
        StageFailure::input(self.step.clone(), message)
    }

    /// Read a required upstream artifact
    pub async fn read_json<T: DeserializeOwned>(&self, key: ArtifactKey) -> Result<T, StageFailure> {
        let path = self.input_path(key);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| self.invalid(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| self.invalid(format!("malformed {}: {}", path.display(), e)))
    }

    /// Read an upstream artifact that may legitimately be absent
    pub async fn read_optional_json<T: DeserializeOwned>(
        &self,
        key: ArtifactKey,
    ) -> Result<Option<T>, StageFailure> {
        let path = self.input_path(key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read_json(key).await.map(Some)
    }

    pub async fn write_json<T: Serialize>(&self, key: ArtifactKey, value: &T) -> Result<(), StageFailure> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| self.failure(format!("cannot serialize {}: {}", key.file_name(), e)))?;
        self.write_text(key, &json).await
    }

    pub async fn write_text(&self, key: ArtifactKey, text: &str) -> Result<(), StageFailure> {
        write_file(&self.output_path(key), text.as_bytes()).await.at_step(&self.step)
    }

    /// Call a collaborator under the configured retry policy and budget
    pub async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T, StageFailure>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let limits = CallLimits {
            attempt_timeout: self.limits.call_timeout(),
            budget: self.limits.budget(),
        };
        call_with_retry(&self.retry, limits, label, op)
            .await
            .at_step(&self.step)
    }
}

/// Atomic file write off the async runtime
pub(crate) async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// `mm:ss` or `h:mm:ss`
pub(crate) fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fakes for stage tests.

    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use std::path::PathBuf;
    use std::sync::Arc;

    use super::StageContext;
    use crate::adapters::analysis::NoopAnalyzer;
    use crate::adapters::diarize::TrackDiarizer;
    use crate::adapters::tags::SidecarTagWriter;
    use crate::adapters::wav::{write_wav, WavEngine};
    use crate::adapters::{
        AnalysisChunk, AudioBuffer, ProviderError, Providers, SemanticAnalyzer, Transcriber,
        TranscriptionRequest,
    };
    use crate::config::Limits;
    use crate::core::retry::RetryPolicy;
    use crate::domain::manifest::{Episode, Manifest, Participant, Role, StageId, TRACKS_DIR};
    use crate::domain::transcript::{Segment, Transcript, Word};
    use crate::domain::ContextDocument;

    /// In-process collaborators: WAV engine, sidecar tags, no analysis
    pub fn providers(transcriber: Arc<dyn Transcriber>) -> Providers {
        Providers {
            transcriber,
            diarizer: Arc::new(TrackDiarizer),
            analyzer: Arc::new(NoopAnalyzer),
            engine: Arc::new(WavEngine::new()),
            tags: Arc::new(SidecarTagWriter),
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    /// Write one 16-bit track per participant and build a manifest for them.
    /// The first participant is the host.
    pub fn session(dir: &Path, tracks: &[(&str, Vec<f32>)], sample_rate: u32) -> Manifest {
        std::fs::create_dir_all(dir.join(TRACKS_DIR)).unwrap();
        let participants = tracks
            .iter()
            .enumerate()
            .map(|(i, (name, samples))| {
                let track = PathBuf::from(TRACKS_DIR).join(format!("{}.wav", name));
                write_wav(
                    &dir.join(&track),
                    &AudioBuffer::new(samples.clone(), sample_rate),
                    16,
                )
                .unwrap();
                Participant {
                    name: name.to_string(),
                    role: if i == 0 { Role::Host } else { Role::Guest },
                    track,
                }
            })
            .collect();

        Manifest::new(
            Episode {
                id: Episode::derive_id("Test Show", 1),
                show: "Test Show".into(),
                title: "Pilot".into(),
                episode_number: 1,
                recording_date: None,
                participants,
            },
            sample_rate,
        )
    }

    /// Context whose staging directory is the stage's final directory
    pub fn context(dir: &Path, manifest: &Manifest, stage: StageId, providers: Providers) -> StageContext {
        let staging = dir.join("artifacts").join(stage.as_str());
        std::fs::create_dir_all(&staging).unwrap();
        StageContext::new(
            dir.to_path_buf(),
            manifest.clone(),
            staging,
            providers,
            fast_retry(),
            Limits::default(),
        )
    }

    /// Returns the same words for every track, labelled with the speaker
    pub struct ScriptedTranscriber {
        pub words: Vec<(&'static str, f64, f64)>,
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn transcribe(
            &self,
            _audio: &Path,
            request: &TranscriptionRequest,
            _timeout: Duration,
        ) -> Result<Transcript, ProviderError> {
            let words: Vec<Word> = self
                .words
                .iter()
                .map(|&(text, start, end)| Word {
                    text: text.to_string(),
                    start,
                    end,
                    confidence: 0.95,
                })
                .collect();
            let start = words.first().map(|w| w.start).unwrap_or(0.0);
            let end = words.last().map(|w| w.end).unwrap_or(0.0);
            Ok(Transcript {
                language: Some("en".into()),
                duration_seconds: end,
                segments: vec![Segment {
                    speaker: request.speaker.clone(),
                    start,
                    end,
                    text: self.words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
                    words,
                }],
            })
        }
    }

    pub struct FailingAnalyzer;

    #[async_trait]
    impl SemanticAnalyzer for FailingAnalyzer {
        fn name(&self) -> &str {
            "failing"
        }

        async fn analyze(
            &self,
            _chunk: &AnalysisChunk,
            _timeout: Duration,
        ) -> Result<ContextDocument, ProviderError> {
            Err(ProviderError::permanent("failing", "service down"))
        }
    }
}
