//! Provider interfaces for external collaborators.
//!
//! Each capability (transcribe, diarize, analyze, transform audio, write
//! tags) is one trait with interchangeable implementations. Stages only see
//! trait objects; which implementation runs is decided once from
//! configuration in [`Providers::from_config`].

pub mod analysis;
pub mod diarize;
pub mod ffmpeg;
pub mod tags;
pub mod wav;
pub mod whisper;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AnalyzerKind, EngineKind, ResolvedConfig, TagWriterKind};
use crate::domain::edl::Chapter;
use crate::domain::span::TickSpan;
use crate::domain::{ContextDocument, Transcript};

pub use analysis::{HttpAnalyzer, NoopAnalyzer};
pub use diarize::TrackDiarizer;
pub use ffmpeg::FfmpegEngine;
pub use tags::{FfmpegTagWriter, SidecarTagWriter};
pub use wav::WavEngine;
pub use whisper::WhisperTranscriber;

/// Failure reported by a collaborator
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout, rate limit or dropped connection; worth retrying
    #[error("{provider}: transient failure: {message}")]
    Transient { provider: String, message: String },

    #[error("{provider}: {message}")]
    Permanent { provider: String, message: String },

    #[error("{provider}: invalid input: {message}")]
    InvalidInput { provider: String, message: String },

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_input(provider: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported(provider: &str, capability: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.to_string(),
            capability: capability.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transient { .. } => true,
            ProviderError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Parameters for one transcription call
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub language: Option<String>,
    /// Label written into every segment
    pub speaker: String,
}

/// Audio to word-level timed text
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &Path,
        request: &TranscriptionRequest,
        timeout: Duration,
    ) -> Result<Transcript, ProviderError>;
}

/// Speaker labelling of a transcript
#[async_trait]
pub trait Diarizer: Send + Sync {
    fn name(&self) -> &str;

    /// Return the transcript with every segment attributed to a speaker
    async fn diarize(
        &self,
        audio: &Path,
        transcript: Transcript,
        speaker: &str,
    ) -> Result<Transcript, ProviderError>;
}

/// A bounded slice of the merged transcript sent for analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisChunk {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// One `[mm:ss] speaker: text` line per segment
    pub text: String,
}

/// Transcript text to topics, structure and tangent candidates
#[async_trait]
pub trait SemanticAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// False when the analyzer never produces anything
    fn is_enabled(&self) -> bool {
        true
    }

    async fn analyze(
        &self,
        chunk: &AnalysisChunk,
        timeout: Duration,
    ) -> Result<ContextDocument, ProviderError>;
}

/// Mono PCM at a known rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

/// What `probe` reports about a source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
}

impl AudioInfo {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames as f64 / self.sample_rate as f64
        }
    }
}

/// Per-region processing hooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum Filter {
    NoiseReduction { floor_db: i32 },
    Compression { threshold_db: f64, ratio: f64 },
    DeEssing,
    Gain { db: f64 },
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::NoiseReduction { .. } => "noise_reduction",
            Filter::Compression { .. } => "compression",
            Filter::DeEssing => "de_essing",
            Filter::Gain { .. } => "gain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessStats {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessTarget {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
}

/// Container/codec for `encode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFormat {
    Wav { bits_per_sample: u16 },
    Mp3 { bitrate_kbps: u32 },
}

/// Region extraction, filtering, loudness and encoding
#[async_trait]
pub trait AudioEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self, path: &Path) -> Result<AudioInfo, ProviderError>;

    /// Whole file, downmixed to mono and resampled to `sample_rate`
    async fn decode(&self, path: &Path, sample_rate: u32) -> Result<AudioBuffer, ProviderError>;

    /// `span` in ticks at `sample_rate`; reads past the end pad with silence
    async fn extract(
        &self,
        path: &Path,
        span: TickSpan,
        sample_rate: u32,
    ) -> Result<AudioBuffer, ProviderError>;

    async fn apply_filter(
        &self,
        buffer: AudioBuffer,
        filter: &Filter,
    ) -> Result<AudioBuffer, ProviderError>;

    async fn measure_loudness(&self, buffer: &AudioBuffer) -> Result<LoudnessStats, ProviderError>;

    async fn normalize(
        &self,
        buffer: AudioBuffer,
        target: &LoudnessTarget,
    ) -> Result<AudioBuffer, ProviderError>;

    fn supports(&self, format: EncodeFormat) -> bool;

    async fn encode(
        &self,
        buffer: &AudioBuffer,
        path: &Path,
        format: EncodeFormat,
    ) -> Result<(), ProviderError>;
}

/// Metadata embedded into the deliverables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub track_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Closes the last chapter
    pub duration_seconds: f64,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    /// Image in the media's directory, relative to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_art: Option<PathBuf>,
}

/// Metadata and chapter embedding
#[async_trait]
pub trait TagWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Tag `media` in place; returns any extra files written next to it
    async fn write_tags(
        &self,
        media: &Path,
        tags: &EpisodeTags,
    ) -> Result<Vec<PathBuf>, ProviderError>;
}

/// The collaborator set a pipeline run uses
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub diarizer: Arc<dyn Diarizer>,
    pub analyzer: Arc<dyn SemanticAnalyzer>,
    pub engine: Arc<dyn AudioEngine>,
    pub tags: Arc<dyn TagWriter>,
}

impl Providers {
    /// Pick implementations according to configuration
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let transcriber: Arc<dyn Transcriber> =
            Arc::new(WhisperTranscriber::with_binary_path(&config.binaries.whisper));

        let analyzer: Arc<dyn SemanticAnalyzer> = match (&config.providers.analyzer, &config.analysis_url) {
            (AnalyzerKind::Http, Some(url)) => Arc::new(HttpAnalyzer::new(url.clone())),
            _ => Arc::new(NoopAnalyzer),
        };

        let engine: Arc<dyn AudioEngine> = match config.providers.engine {
            EngineKind::Wav => Arc::new(WavEngine::new()),
            EngineKind::Ffmpeg => Arc::new(FfmpegEngine::with_binaries(
                &config.binaries.ffmpeg,
                &config.binaries.ffprobe,
            )),
        };

        let tags: Arc<dyn TagWriter> = match config.providers.tags {
            TagWriterKind::Sidecar => Arc::new(SidecarTagWriter),
            TagWriterKind::Ffmpeg => Arc::new(FfmpegTagWriter::with_binary_path(&config.binaries.ffmpeg)),
        };

        Self {
            transcriber,
            diarizer: Arc::new(TrackDiarizer),
            analyzer,
            engine,
            tags,
        }
    }

    /// Human-readable summary, e.g. for `podflow config`
    pub fn describe(&self) -> String {
        format!(
            "transcriber={} diarizer={} analyzer={} engine={} tags={}",
            self.transcriber.name(),
            self.diarizer.name(),
            self.analyzer.name(),
            self.engine.name(),
            self.tags.name()
        )
    }
}
