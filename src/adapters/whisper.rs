//! Transcription through the `whisper` command line tool.
//!
//! The tool writes `<stem>.json` into an output directory; we point it at a
//! scratch directory and parse segments with word timestamps from there.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ProviderError, Transcriber, TranscriptionRequest};
use crate::domain::transcript::{Segment, Transcript, Word};

const NAME: &str = "whisper";

/// Whisper adapter using subprocess mode
pub struct WhisperTranscriber {
    /// Path to the whisper binary (default: "whisper")
    binary_path: String,
}

impl Default for WhisperTranscriber {
    fn default() -> Self {
        Self::with_binary_path("whisper")
    }
}

impl WhisperTranscriber {
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default = "default_probability")]
    probability: f64,
}

fn default_probability() -> f64 {
    1.0
}

/// Convert whisper's JSON into a transcript attributed to `speaker`
pub(crate) fn parse_output(json: &str, speaker: &str) -> Result<Transcript, ProviderError> {
    let output: WhisperOutput = serde_json::from_str(json)
        .map_err(|e| ProviderError::permanent(NAME, format!("unreadable transcript: {}", e)))?;

    let segments: Vec<Segment> = output
        .segments
        .into_iter()
        .map(|seg| Segment {
            speaker: speaker.to_string(),
            start: seg.start,
            end: seg.end,
            text: seg.text.trim().to_string(),
            words: seg
                .words
                .into_iter()
                .filter(|w| !w.word.trim().is_empty())
                .map(|w| Word {
                    text: w.word.trim().to_string(),
                    start: w.start,
                    end: w.end,
                    confidence: w.probability.clamp(0.0, 1.0),
                })
                .collect(),
        })
        .collect();

    let duration_seconds = segments.iter().map(|s| s.end).fold(0.0, f64::max);
    Ok(Transcript {
        language: output.language,
        duration_seconds,
        segments,
    })
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        NAME
    }

    async fn transcribe(
        &self,
        audio: &Path,
        request: &TranscriptionRequest,
        call_timeout: Duration,
    ) -> Result<Transcript, ProviderError> {
        let scratch = tempfile::TempDir::new()?;
        let stem = audio
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ProviderError::invalid_input(NAME, format!("bad file name: {}", audio.display())))?;

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg(audio)
            .args(["--model", request.model.as_str()])
            .args(["--output_format", "json"])
            .arg("--output_dir")
            .arg(scratch.path())
            .args(["--word_timestamps", "True"]);
        if let Some(language) = &request.language {
            cmd.args(["--language", language.as_str()]);
        }
        debug!("Transcribing {} with {}", audio.display(), request.model);

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::permanent(NAME, format!("failed to spawn {}: {}", self.binary_path, e)))?;

        let output = timeout(call_timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::transient(NAME, format!("timed out after {:?}", call_timeout)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::permanent(
                NAME,
                format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        let json = tokio::fs::read_to_string(scratch.path().join(format!("{}.json", stem))).await?;
        parse_output(&json, &request.speaker)
    }
}
