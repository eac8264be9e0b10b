//! In-process audio engine for WAV sources, built on `hound`.
//!
//! Loudness figures are an approximation of BS.1770 (gated block energy
//! without the K-weighting pre-filter); good enough to level an episode,
//! not a compliance meter. MP3 output needs the ffmpeg engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::{
    AudioBuffer, AudioEngine, AudioInfo, EncodeFormat, Filter, LoudnessStats, LoudnessTarget,
    ProviderError,
};
use crate::align::resample::{decimate, linear_resample};
use crate::domain::span::TickSpan;

const NAME: &str = "wav";

/// Gain applied to blocks under the noise floor
const GATE_ATTENUATION: f32 = 0.25;

/// Block length for the noise gate, in milliseconds
const GATE_BLOCK_MS: u32 = 10;

fn hound_error(path: &Path, e: hound::Error) -> ProviderError {
    match e {
        hound::Error::IoError(io) => ProviderError::Io(io),
        other => ProviderError::invalid_input(NAME, format!("{}: {}", path.display(), other)),
    }
}

/// Read `count` frames from `start`, downmixed to mono
fn read_frames(path: &Path, start: u64, count: Option<u64>) -> Result<(Vec<f32>, WavSpec), ProviderError> {
    let mut reader = WavReader::open(path).map_err(|e| hound_error(path, e))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let total = reader.duration() as u64;

    if start >= total {
        return Ok((Vec::new(), spec));
    }
    let start_u32 = u32::try_from(start)
        .map_err(|_| ProviderError::invalid_input(NAME, "seek position out of range"))?;
    reader.seek(start_u32)?;

    let frames = count.unwrap_or(total - start).min(total - start) as usize;
    let wanted = frames * channels;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .take(wanted)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| hound_error(path, e))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .take(wanted)
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| hound_error(path, e))?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, spec))
}

fn convert_rate(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from > to {
        decimate(samples, from, to)
    } else {
        linear_resample(samples, from, to)
    }
}

fn db_to_gain(db: f64) -> f32 {
    10f64.powf(db / 20.0) as f32
}

fn gain_to_db(gain: f64) -> f64 {
    if gain <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * gain.log10()
    }
}

/// Attenuate 10 ms blocks whose RMS sits under the floor
fn noise_gate(buffer: &mut AudioBuffer, floor_db: i32) {
    let floor = db_to_gain(floor_db as f64);
    let block = (buffer.sample_rate * GATE_BLOCK_MS / 1000).max(1) as usize;
    for chunk in buffer.samples.chunks_mut(block) {
        let rms = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
        if rms < floor {
            chunk.iter_mut().for_each(|s| *s *= GATE_ATTENUATION);
        }
    }
}

/// Feed-forward peak compressor (5 ms attack, 50 ms release)
fn compress(buffer: &mut AudioBuffer, threshold_db: f64, ratio: f64) {
    let rate = buffer.sample_rate as f32;
    let attack = (-1.0 / (0.005 * rate)).exp();
    let release = (-1.0 / (0.050 * rate)).exp();
    let mut envelope = 0.0f32;

    for s in buffer.samples.iter_mut() {
        let level = s.abs();
        let coeff = if level > envelope { attack } else { release };
        envelope = coeff * envelope + (1.0 - coeff) * level;

        let level_db = gain_to_db(envelope as f64);
        if level_db > threshold_db {
            let reduced = threshold_db + (level_db - threshold_db) / ratio.max(1.0);
            *s *= db_to_gain(reduced - level_db);
        }
    }
}

/// Gated block loudness in LUFS (400 ms blocks, 75 % overlap)
fn integrated_loudness(buffer: &AudioBuffer) -> f64 {
    let block = (buffer.sample_rate as usize * 400 / 1000).max(1);
    let hop = (block / 4).max(1);
    let to_lufs = |ms: f64| -0.691 + 10.0 * ms.log10();

    let mut energies = Vec::new();
    let mut start = 0;
    while start + block <= buffer.samples.len() {
        let ms = buffer.samples[start..start + block]
            .iter()
            .map(|&s| s as f64 * s as f64)
            .sum::<f64>()
            / block as f64;
        energies.push(ms);
        start += hop;
    }
    if energies.is_empty() && !buffer.samples.is_empty() {
        let len = buffer.samples.len() as f64;
        energies.push(buffer.samples.iter().map(|&s| s as f64 * s as f64).sum::<f64>() / len);
    }

    let above_absolute: Vec<f64> = energies.into_iter().filter(|&e| e > 0.0 && to_lufs(e) > -70.0).collect();
    if above_absolute.is_empty() {
        return -70.0;
    }
    let mean = above_absolute.iter().sum::<f64>() / above_absolute.len() as f64;
    let relative_gate = to_lufs(mean) - 10.0;
    let gated: Vec<f64> = above_absolute
        .into_iter()
        .filter(|&e| to_lufs(e) > relative_gate)
        .collect();
    to_lufs(gated.iter().sum::<f64>() / gated.len().max(1) as f64)
}

/// Engine operating on WAV files without external processes
#[derive(Debug, Clone, Default)]
pub struct WavEngine;

impl WavEngine {
    pub fn new() -> Self {
        Self
    }

    fn measure(buffer: &AudioBuffer) -> LoudnessStats {
        LoudnessStats {
            integrated_lufs: integrated_loudness(buffer),
            true_peak_dbtp: gain_to_db(buffer.peak() as f64),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::permanent(NAME, format!("worker panicked: {}", e)))?
}

#[async_trait]
impl AudioEngine for WavEngine {
    fn name(&self) -> &str {
        NAME
    }

    async fn probe(&self, path: &Path) -> Result<AudioInfo, ProviderError> {
        let path = path.to_path_buf();
        blocking(move || {
            let reader = WavReader::open(&path).map_err(|e| hound_error(&path, e))?;
            let spec = reader.spec();
            Ok(AudioInfo {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                frames: reader.duration() as u64,
            })
        })
        .await
    }

    async fn decode(&self, path: &Path, sample_rate: u32) -> Result<AudioBuffer, ProviderError> {
        let path = path.to_path_buf();
        blocking(move || {
            let (samples, spec) = read_frames(&path, 0, None)?;
            Ok(AudioBuffer::new(
                convert_rate(&samples, spec.sample_rate, sample_rate),
                sample_rate,
            ))
        })
        .await
    }

    async fn extract(
        &self,
        path: &Path,
        span: TickSpan,
        sample_rate: u32,
    ) -> Result<AudioBuffer, ProviderError> {
        let path: PathBuf = path.to_path_buf();
        blocking(move || {
            let reader = WavReader::open(&path).map_err(|e| hound_error(&path, e))?;
            let source_rate = reader.spec().sample_rate;
            drop(reader);

            let len = span.len() as usize;
            let mut samples = if source_rate == sample_rate {
                read_frames(&path, span.start, Some(span.len()))?.0
            } else {
                let start = span.start * source_rate as u64 / sample_rate as u64;
                let count = span.len() * source_rate as u64 / sample_rate as u64 + 2;
                let (raw, _) = read_frames(&path, start, Some(count))?;
                convert_rate(&raw, source_rate, sample_rate)
            };
            samples.resize(len, 0.0);
            Ok(AudioBuffer::new(samples, sample_rate))
        })
        .await
    }

    async fn apply_filter(
        &self,
        mut buffer: AudioBuffer,
        filter: &Filter,
    ) -> Result<AudioBuffer, ProviderError> {
        match *filter {
            Filter::NoiseReduction { floor_db } => noise_gate(&mut buffer, floor_db),
            Filter::Compression {
                threshold_db,
                ratio,
            } => compress(&mut buffer, threshold_db, ratio),
            Filter::Gain { db } => {
                let gain = db_to_gain(db);
                buffer.samples.iter_mut().for_each(|s| *s *= gain);
            }
            Filter::DeEssing => return Err(ProviderError::unsupported(NAME, "de-essing")),
        }
        Ok(buffer)
    }

    async fn measure_loudness(&self, buffer: &AudioBuffer) -> Result<LoudnessStats, ProviderError> {
        if buffer.is_empty() {
            return Err(ProviderError::invalid_input(NAME, "cannot measure empty audio"));
        }
        Ok(Self::measure(buffer))
    }

    async fn normalize(
        &self,
        mut buffer: AudioBuffer,
        target: &LoudnessTarget,
    ) -> Result<AudioBuffer, ProviderError> {
        let before = self.measure_loudness(&buffer).await?;
        if !before.integrated_lufs.is_finite() {
            return Err(ProviderError::invalid_input(NAME, "cannot normalize silence"));
        }
        let mut gain = db_to_gain(target.integrated_lufs - before.integrated_lufs);

        // A pure gain change: back off until the peak fits under the ceiling
        let ceiling = db_to_gain(target.true_peak_dbtp);
        let peak = buffer.peak() * gain;
        if peak > ceiling && peak > 0.0 {
            gain *= ceiling / peak;
        }

        buffer.samples.iter_mut().for_each(|s| *s *= gain);
        Ok(buffer)
    }

    fn supports(&self, format: EncodeFormat) -> bool {
        matches!(format, EncodeFormat::Wav { .. })
    }

    async fn encode(
        &self,
        buffer: &AudioBuffer,
        path: &Path,
        format: EncodeFormat,
    ) -> Result<(), ProviderError> {
        let EncodeFormat::Wav { bits_per_sample } = format else {
            return Err(ProviderError::unsupported(NAME, "mp3 encoding"));
        };

        let buffer = buffer.clone();
        let path = path.to_path_buf();
        blocking(move || write_wav(&path, &buffer, bits_per_sample)).await
    }
}

/// Write mono PCM (16/24-bit int or 32-bit float)
pub fn write_wav(path: &Path, buffer: &AudioBuffer, bits_per_sample: u16) -> Result<(), ProviderError> {
    let float = bits_per_sample == 32;
    let spec = WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample,
        sample_format: if float {
            SampleFormat::Float
        } else {
            SampleFormat::Int
        },
    };
    if !matches!(bits_per_sample, 16 | 24 | 32) {
        return Err(ProviderError::invalid_input(
            NAME,
            format!("unsupported bit depth {}", bits_per_sample),
        ));
    }

    let mut writer = WavWriter::create(path, spec).map_err(|e| hound_error(path, e))?;
    if float {
        for &s in &buffer.samples {
            writer.write_sample(s.clamp(-1.0, 1.0)).map_err(|e| hound_error(path, e))?;
        }
    } else {
        let max = ((1i64 << (bits_per_sample - 1)) - 1) as f32;
        for &s in &buffer.samples {
            let v = (s.clamp(-1.0, 1.0) * max).round() as i32;
            writer.write_sample(v).map_err(|e| hound_error(path, e))?;
        }
    }
    writer.finalize().map_err(|e| hound_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp(len: usize, rate: u32) -> AudioBuffer {
        AudioBuffer::new((0..len).map(|i| (i % 100) as f32 / 200.0).collect(), rate)
    }

    #[tokio::test]
    async fn test_encode_then_extract_span() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("track.wav");
        let engine = WavEngine::new();

        engine
            .encode(&ramp(8_000, 8_000), &path, EncodeFormat::Wav { bits_per_sample: 32 })
            .await
            .unwrap();

        let info = engine.probe(&path).await.unwrap();
        assert_eq!(info.sample_rate, 8_000);
        assert_eq!(info.frames, 8_000);

        let slice = engine
            .extract(&path, TickSpan::new(7_990, 8_010), 8_000)
            .await
            .unwrap();
        assert_eq!(slice.len(), 20);
        assert!((slice.samples[0] - 90.0 / 200.0).abs() < 1e-6);
        // Past the end pads with silence
        assert_eq!(slice.samples[15], 0.0);
    }

    #[tokio::test]
    async fn test_de_essing_unsupported() {
        let engine = WavEngine::new();
        let err = engine
            .apply_filter(ramp(10, 8_000), &Filter::DeEssing)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_normalize_respects_peak_ceiling() {
        let engine = WavEngine::new();
        let quiet = AudioBuffer::new(
            (0..16_000).map(|i| if i % 2 == 0 { 0.05 } else { -0.05 }).collect(),
            8_000,
        );
        let target = LoudnessTarget {
            integrated_lufs: -6.0,
            true_peak_dbtp: -1.0,
        };

        let out = engine.normalize(quiet, &target).await.unwrap();
        assert!(out.peak() <= db_to_gain(-1.0) + 1e-6);
    }

    #[test]
    fn test_loudness_of_full_scale_square() {
        let square = AudioBuffer::new(
            (0..8_000).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect(),
            8_000,
        );
        assert!((integrated_loudness(&square) + 0.691).abs() < 1e-6);
    }

    #[test]
    fn test_noise_gate_only_touches_quiet_blocks() {
        let mut samples = vec![0.001f32; 80];
        samples.extend(vec![0.5f32; 80]);
        let mut buffer = AudioBuffer::new(samples, 8_000);
        noise_gate(&mut buffer, -25);

        assert!((buffer.samples[0] - 0.00025).abs() < 1e-7);
        assert_eq!(buffer.samples[100], 0.5);
    }
}
