//! Audio engine backed by the `ffmpeg`/`ffprobe` binaries.
//!
//! PCM moves through pipes as mono 32-bit float little endian, so the
//! engine never touches intermediate files except the final encode.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{
    AudioBuffer, AudioEngine, AudioInfo, EncodeFormat, Filter, LoudnessStats, LoudnessTarget,
    ProviderError,
};
use crate::domain::span::TickSpan;

const NAME: &str = "ffmpeg";

/// Per-invocation ceiling when the caller gives none
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Audio engine using ffmpeg subprocesses
pub struct FfmpegEngine {
    ffmpeg: String,
    ffprobe: String,
    call_timeout: Duration,
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::with_binaries("ffmpeg", "ffprobe")
    }
}

impl FfmpegEngine {
    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Run a binary, optionally feeding `input` on stdin
    async fn run(&self, binary: &str, args: &[String], input: Option<Vec<u8>>) -> Result<Output, ProviderError> {
        debug!("{} {}", binary, args.join(" "));

        let mut child = Command::new(binary)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::permanent(NAME, format!("failed to spawn {}: {}", binary, e)))?;

        // Feed stdin concurrently so a full stdout pipe cannot stall the child
        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(mut stdin)) => Some(tokio::spawn(async move {
                let result = stdin.write_all(&bytes).await;
                drop(stdin);
                result
            })),
            _ => None,
        };

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ProviderError::transient(NAME, format!("{} timed out after {:?}", binary, self.call_timeout))
            })??;

        if let Some(handle) = writer {
            // A broken pipe here means the child exited early; its status says why
            let _ = handle.await;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::permanent(
                NAME,
                format!(
                    "{} failed with exit code {}: {}",
                    binary,
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        Ok(output)
    }

    /// Pipe `buffer` through an audio filter graph, returning PCM at the same rate
    async fn filter_pcm(&self, buffer: &AudioBuffer, graph: &str, extra_output: &[&str]) -> Result<Output, ProviderError> {
        let mut args = raw_input_args(buffer.sample_rate);
        args.extend(["-af".to_string(), graph.to_string()]);
        args.extend(extra_output.iter().map(|s| s.to_string()));
        self.run(&self.ffmpeg, &args, Some(encode_pcm(&buffer.samples))).await
    }
}

fn raw_input_args(sample_rate: u32) -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-v",
        "error",
        "-f",
        "f32le",
        "-ar",
        &sample_rate.to_string(),
        "-ac",
        "1",
        "-i",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn raw_output_args(sample_rate: u32) -> Vec<String> {
    ["-ac", "1", "-ar", &sample_rate.to_string(), "-f", "f32le", "-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub(crate) fn decode_pcm(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// ffmpeg filter expression for one hook
pub(crate) fn filter_graph(filter: &Filter) -> String {
    match filter {
        Filter::NoiseReduction { floor_db } => format!("afftdn=nf={}", (*floor_db).clamp(-80, -20)),
        Filter::Compression {
            threshold_db,
            ratio,
        } => format!(
            "acompressor=threshold={}dB:ratio={}",
            threshold_db,
            ratio.clamp(1.0, 20.0)
        ),
        Filter::DeEssing => "deesser".to_string(),
        Filter::Gain { db } => format!("volume={}dB", db),
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

pub(crate) fn parse_probe(json: &str) -> Result<AudioInfo, ProviderError> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| ProviderError::permanent(NAME, format!("unreadable ffprobe output: {}", e)))?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::invalid_input(NAME, "no audio stream"))?;

    let sample_rate: u32 = stream
        .sample_rate
        .as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProviderError::invalid_input(NAME, "audio stream has no sample rate"))?;
    let duration: f64 = stream
        .duration
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    Ok(AudioInfo {
        sample_rate,
        channels: stream.channels.unwrap_or(1),
        frames: (duration * sample_rate as f64).round() as u64,
    })
}

#[derive(Debug, Deserialize)]
struct LoudnormReport {
    input_i: String,
    input_tp: String,
}

/// Pull the JSON block `loudnorm=print_format=json` leaves at the end of stderr
pub(crate) fn parse_loudnorm(stderr: &str) -> Result<LoudnessStats, ProviderError> {
    let start = stderr.rfind('{');
    let end = stderr.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ProviderError::permanent(NAME, "loudnorm produced no report"));
    };
    if end < start {
        return Err(ProviderError::permanent(NAME, "malformed loudnorm report"));
    }

    let report: LoudnormReport = serde_json::from_str(&stderr[start..=end])
        .map_err(|e| ProviderError::permanent(NAME, format!("malformed loudnorm report: {}", e)))?;
    let number = |s: &str| -> f64 {
        // "-inf" for silence
        s.trim().parse().unwrap_or(f64::NEG_INFINITY)
    };

    Ok(LoudnessStats {
        integrated_lufs: number(&report.input_i),
        true_peak_dbtp: number(&report.input_tp),
    })
}

#[async_trait]
impl AudioEngine for FfmpegEngine {
    fn name(&self) -> &str {
        NAME
    }

    async fn probe(&self, path: &Path) -> Result<AudioInfo, ProviderError> {
        let args: Vec<String> = [
            "-v",
            "error",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=sample_rate,channels,duration",
            "-of",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(path.display().to_string()))
        .collect();

        let output = self.run(&self.ffprobe, &args, None).await?;
        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }

    async fn decode(&self, path: &Path, sample_rate: u32) -> Result<AudioBuffer, ProviderError> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            path.display().to_string(),
        ];
        args.extend(raw_output_args(sample_rate));

        let output = self.run(&self.ffmpeg, &args, None).await?;
        Ok(AudioBuffer::new(decode_pcm(&output.stdout), sample_rate))
    }

    async fn extract(
        &self,
        path: &Path,
        span: TickSpan,
        sample_rate: u32,
    ) -> Result<AudioBuffer, ProviderError> {
        let (start, end) = span.seconds(sample_rate);
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            path.display().to_string(),
            "-ss".into(),
            format!("{:.6}", start),
            "-t".into(),
            format!("{:.6}", end - start),
        ];
        args.extend(raw_output_args(sample_rate));

        let output = self.run(&self.ffmpeg, &args, None).await?;
        let mut samples = decode_pcm(&output.stdout);
        samples.resize(span.len() as usize, 0.0);
        Ok(AudioBuffer::new(samples, sample_rate))
    }

    async fn apply_filter(
        &self,
        buffer: AudioBuffer,
        filter: &Filter,
    ) -> Result<AudioBuffer, ProviderError> {
        let rate = buffer.sample_rate;
        let out_args = raw_output_args(rate);
        let out: Vec<&str> = out_args.iter().map(String::as_str).collect();
        let output = self.filter_pcm(&buffer, &filter_graph(filter), &out).await?;

        let mut samples = decode_pcm(&output.stdout);
        samples.resize(buffer.len(), 0.0);
        Ok(AudioBuffer::new(samples, rate))
    }

    async fn measure_loudness(&self, buffer: &AudioBuffer) -> Result<LoudnessStats, ProviderError> {
        if buffer.is_empty() {
            return Err(ProviderError::invalid_input(NAME, "cannot measure empty audio"));
        }
        let output = self
            .filter_pcm(buffer, "loudnorm=print_format=json", &["-f", "null", "-"])
            .await?;
        parse_loudnorm(&String::from_utf8_lossy(&output.stderr))
    }

    async fn normalize(
        &self,
        buffer: AudioBuffer,
        target: &LoudnessTarget,
    ) -> Result<AudioBuffer, ProviderError> {
        let measured = self.measure_loudness(&buffer).await?;
        let mut graph = format!(
            "loudnorm=I={}:TP={}:LRA=11",
            target.integrated_lufs, target.true_peak_dbtp
        );
        if measured.integrated_lufs.is_finite() && measured.true_peak_dbtp.is_finite() {
            graph.push_str(&format!(
                ":measured_I={}:measured_TP={}:linear=true",
                measured.integrated_lufs, measured.true_peak_dbtp
            ));
        }

        // loudnorm upsamples internally; the output args bring it back
        let rate = buffer.sample_rate;
        let out_args = raw_output_args(rate);
        let out: Vec<&str> = out_args.iter().map(String::as_str).collect();
        let output = self.filter_pcm(&buffer, &graph, &out).await?;

        let mut samples = decode_pcm(&output.stdout);
        samples.resize(buffer.len(), 0.0);
        Ok(AudioBuffer::new(samples, rate))
    }

    fn supports(&self, _format: EncodeFormat) -> bool {
        true
    }

    async fn encode(
        &self,
        buffer: &AudioBuffer,
        path: &Path,
        format: EncodeFormat,
    ) -> Result<(), ProviderError> {
        let codec: Vec<String> = match format {
            EncodeFormat::Wav { bits_per_sample } => {
                let codec = match bits_per_sample {
                    16 => "pcm_s16le",
                    24 => "pcm_s24le",
                    32 => "pcm_f32le",
                    other => {
                        return Err(ProviderError::invalid_input(
                            NAME,
                            format!("unsupported bit depth {}", other),
                        ))
                    }
                };
                vec!["-c:a".into(), codec.into(), "-f".into(), "wav".into()]
            }
            EncodeFormat::Mp3 { bitrate_kbps } => vec![
                "-c:a".into(),
                "libmp3lame".into(),
                "-b:a".into(),
                format!("{}k", bitrate_kbps),
                "-f".into(),
                "mp3".into(),
            ],
        };

        let mut args = raw_input_args(buffer.sample_rate);
        args.extend(codec);
        args.extend(["-y".to_string(), path.display().to_string()]);
        self.run(&self.ffmpeg, &args, Some(encode_pcm(&buffer.samples)))
            .await
            .map(|_| ())
    }
}
