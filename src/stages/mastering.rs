//! Mastering: mixed stream in, loudness-normalized deliverables out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{Stage, StageContext};
use crate::adapters::{AudioBuffer, EncodeFormat, EpisodeTags, LoudnessStats, LoudnessTarget};
use crate::core::error::StageFailure;
use crate::domain::edl::{Chapter, EditList};
use crate::domain::manifest::{ArtifactKey, Episode, StageId};

pub struct MasteringStage;

/// Record written next to the deliverables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteringMetadata {
    pub episode: Episode,
    pub sample_rate: u32,
    pub duration_seconds: f64,
    pub target: LoudnessTarget,
    pub loudness_before: LoudnessStats,
    pub loudness_after: LoudnessStats,
    pub verification: Verification,
    pub chapters: Vec<Chapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_art: Option<PathBuf>,
    /// Deliverable file name -> size in bytes
    pub files: BTreeMap<String, u64>,
    pub mastered_at: DateTime<Utc>,
}

/// The normalized output measured against the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub tolerance_lu: f64,
    pub lufs_on_target: bool,
    pub tp_within_ceiling: bool,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Check `measured` against `target`, warning once per failed check
pub fn verify(measured: &LoudnessStats, target: &LoudnessTarget, tolerance_lu: f64) -> Verification {
    let lufs_on_target = (measured.integrated_lufs - target.integrated_lufs).abs() <= tolerance_lu;
    let tp_within_ceiling = measured.true_peak_dbtp <= target.true_peak_dbtp;

    let mut warnings = Vec::new();
    if !lufs_on_target {
        warn!(
            measured_lufs = measured.integrated_lufs,
            target_lufs = target.integrated_lufs,
            tolerance_lu,
            "Output loudness off target"
        );
        warnings.push(format!(
            "loudness {:.1} LUFS deviates from the {:.1} LUFS target by more than {} LU",
            measured.integrated_lufs, target.integrated_lufs, tolerance_lu
        ));
    }
    if !tp_within_ceiling {
        warn!(
            peak_dbtp = measured.true_peak_dbtp,
            ceiling_dbtp = target.true_peak_dbtp,
            "Output true peak above ceiling"
        );
        warnings.push(format!(
            "true peak {:.1} dBTP exceeds the {:.1} dBTP ceiling",
            measured.true_peak_dbtp, target.true_peak_dbtp
        ));
    }

    Verification {
        integrated_lufs: measured.integrated_lufs,
        true_peak_dbtp: measured.true_peak_dbtp,
        tolerance_lu,
        lufs_on_target,
        tp_within_ceiling,
        passed: lufs_on_target && tp_within_ceiling,
        warnings,
    }
}

#[async_trait]
impl Stage for MasteringStage {
    fn id(&self) -> StageId {
        StageId::Mastering
    }

    fn required_outputs(&self) -> Vec<ArtifactKey> {
        vec![
            ArtifactKey::MasteredWav,
            ArtifactKey::ShowNotes,
            ArtifactKey::Metadata,
        ]
    }

    #[instrument(skip_all, fields(stage = "mastering"))]
    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure> {
        let settings = ctx.manifest.config.mastering.clone();
        let engine = ctx.providers.engine.clone();
        let rate = ctx.sample_rate();

        ctx.begin("load");
        let mixed = ctx.input_path(ArtifactKey::MixedAudio);
        let audio = ctx
            .call("decode", |_| {
                let engine = engine.clone();
                let mixed = mixed.clone();
                async move { engine.decode(&mixed, rate).await }
            })
            .await?;
        if audio.is_empty() {
            return Err(ctx.invalid("mixed audio is empty"));
        }
        let audio = Arc::new(audio);
        let list: EditList = ctx.read_json(ArtifactKey::EdlSidecar).await?;

        ctx.begin("measure");
        let before = measure(ctx, &audio).await?;

        ctx.begin("normalize");
        let target = LoudnessTarget {
            integrated_lufs: settings.target_lufs,
            true_peak_dbtp: settings.true_peak_dbtp,
        };
        let mastered = ctx
            .call("normalize", |_| {
                let engine = engine.clone();
                let buffer = AudioBuffer::clone(&audio);
                async move { engine.normalize(buffer, &target).await }
            })
            .await?;
        let mastered = Arc::new(mastered);
        let after = measure(ctx, &mastered).await?;
        info!(
            before_lufs = before.integrated_lufs,
            after_lufs = after.integrated_lufs,
            peak_dbtp = after.true_peak_dbtp,
            "Loudness normalized"
        );

        ctx.begin("encode");
        let mut deliverables = vec![ArtifactKey::MasteredWav];
        encode(ctx, &mastered, ArtifactKey::MasteredWav, EncodeFormat::Wav { bits_per_sample: 24 }).await?;
        if settings.mp3 {
            let format = EncodeFormat::Mp3 {
                bitrate_kbps: settings.mp3_bitrate_kbps,
            };
            if engine.supports(format) {
                encode(ctx, &mastered, ArtifactKey::MasteredMp3, format).await?;
                deliverables.push(ArtifactKey::MasteredMp3);
            } else {
                warn!(engine = engine.name(), "Engine cannot write MP3, delivering WAV only");
            }
        }

        ctx.begin("verify");
        let verification = verify(&after, &target, settings.loudness_tolerance_lu);
        if verification.passed {
            info!(
                lufs = after.integrated_lufs,
                peak_dbtp = after.true_peak_dbtp,
                "Output verified"
            );
        }

        ctx.begin("tags");
        let cover_art = match &settings.cover_art {
            Some(file) => stage_cover_art(ctx, file).await,
            None => None,
        };
        let episode = ctx.manifest.episode.clone();
        let tags = EpisodeTags {
            title: episode.title.clone(),
            artist: episode.show.clone(),
            album: episode.show.clone(),
            genre: settings.genre.clone(),
            track_number: episode.episode_number,
            date: episode.recording_date.map(|d| d.to_string()),
            duration_seconds: mastered.duration_seconds(),
            chapters: if settings.embed_chapters {
                list.chapters.clone()
            } else {
                Vec::new()
            },
            cover_art: cover_art.clone(),
        };
        for &key in &deliverables {
            let writer = ctx.providers.tags.clone();
            let path = ctx.output_path(key);
            ctx.call("tags", |_| {
                let writer = writer.clone();
                let path = path.clone();
                let tags = tags.clone();
                async move { writer.write_tags(&path, &tags).await }
            })
            .await?;
        }

        ctx.begin("metadata");
        let mut files = BTreeMap::new();
        for &key in &deliverables {
            let meta = tokio::fs::metadata(ctx.output_path(key))
                .await
                .map_err(|e| ctx.failure(format!("{} missing after encode: {}", key.file_name(), e)))?;
            files.insert(key.file_name().to_string(), meta.len());
        }
        if let Some(cover) = &cover_art {
            if let Ok(meta) = tokio::fs::metadata(ctx.staging.join(cover)).await {
                files.insert(cover.display().to_string(), meta.len());
            }
        }
        let metadata = MasteringMetadata {
            episode,
            sample_rate: rate,
            duration_seconds: mastered.duration_seconds(),
            target,
            loudness_before: before,
            loudness_after: after,
            verification,
            chapters: list.chapters,
            cover_art,
            files,
            mastered_at: Utc::now(),
        };
        ctx.write_json(ArtifactKey::Metadata, &metadata).await?;

        ctx.begin("show_notes");
        let summary = ctx.input_path(ArtifactKey::ContentSummary);
        let notes = tokio::fs::read_to_string(&summary)
            .await
            .map_err(|e| ctx.invalid(format!("cannot read {}: {}", summary.display(), e)))?;
        ctx.write_text(ArtifactKey::ShowNotes, &notes).await?;
        ctx.finish();

        info!(
            deliverables = deliverables.len(),
            duration_s = metadata.duration_seconds,
            "Mastering finished"
        );
        Ok(())
    }
}

/// Copy the configured cover next to the deliverables as `cover.<ext>`.
/// A missing or unsupported image is skipped with a warning.
async fn stage_cover_art(ctx: &StageContext, file: &Path) -> Option<PathBuf> {
    let source = ctx.session_dir.join(file);
    let extension = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let extension = match extension.as_deref() {
        Some("jpg" | "jpeg") => "jpg",
        Some("png") => "png",
        _ => {
            warn!(file = %source.display(), "Cover art must be JPEG or PNG, skipping");
            return None;
        }
    };

    let name = PathBuf::from(format!("cover.{}", extension));
    match tokio::fs::copy(&source, ctx.staging.join(&name)).await {
        Ok(bytes) => {
            info!(file = %source.display(), bytes, "Cover art staged");
            Some(name)
        }
        Err(e) => {
            warn!(file = %source.display(), error = %e, "Cover art unavailable, skipping");
            None
        }
    }
}

async fn measure(ctx: &StageContext, audio: &Arc<AudioBuffer>) -> Result<LoudnessStats, StageFailure> {
    let engine = ctx.providers.engine.clone();
    ctx.call("measure", |_| {
        let engine = engine.clone();
        let audio = audio.clone();
        async move { engine.measure_loudness(&audio).await }
    })
    .await
}

async fn encode(
    ctx: &StageContext,
    audio: &Arc<AudioBuffer>,
    key: ArtifactKey,
    format: EncodeFormat,
) -> Result<(), StageFailure> {
    let engine = ctx.providers.engine.clone();
    let path = ctx.output_path(key);
    ctx.call("encode", |_| {
        let engine = engine.clone();
        let audio = audio.clone();
        let path = path.clone();
        async move { engine.encode(&audio, &path, format).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::wav::WavEngine;
    use crate::adapters::AudioEngine;

    fn target() -> LoudnessTarget {
        LoudnessTarget {
            integrated_lufs: -16.0,
            true_peak_dbtp: -1.0,
        }
    }

    #[test]
    fn test_on_target_output_passes() {
        let measured = LoudnessStats {
            integrated_lufs: -16.3,
            true_peak_dbtp: -1.4,
        };
        let v = verify(&measured, &target(), 0.5);

        assert!(v.lufs_on_target);
        assert!(v.tp_within_ceiling);
        assert!(v.passed);
        assert!(v.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_clipped_output_fails_ceiling() {
        let rate = 8_000u32;
        // Overdriven sine flattened at full scale
        let samples: Vec<f32> = (0..rate * 2)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32;
                (1.8 * phase.sin()).clamp(-1.0, 1.0)
            })
            .collect();
        let measured = WavEngine::new()
            .measure_loudness(&AudioBuffer::new(samples, rate))
            .await
            .unwrap();
        let v = verify(&measured, &target(), 0.5);

        assert_eq!(measured.true_peak_dbtp, 0.0);
        assert!(!v.tp_within_ceiling);
        assert!(!v.passed);
        assert!(v.warnings.iter().any(|w| w.contains("ceiling")));
    }

    #[tokio::test]
    async fn test_peak_limited_gain_misses_loudness_target() {
        let rate = 8_000u32;
        // Sparse clicks: reaching -16 LUFS would push them far past the ceiling
        let mut samples = vec![0.0f32; rate as usize * 4];
        for i in (0..samples.len()).step_by(rate as usize / 2) {
            samples[i] = 0.9;
        }
        let engine = WavEngine::new();
        let normalized = engine
            .normalize(AudioBuffer::new(samples, rate), &target())
            .await
            .unwrap();
        let measured = engine.measure_loudness(&normalized).await.unwrap();
        let v = verify(&measured, &target(), 0.5);

        assert!(measured.integrated_lufs < -30.0, "lufs {}", measured.integrated_lufs);
        assert!(!v.lufs_on_target);
        assert!(!v.passed);
        assert_eq!(v.warnings.len(), if v.tp_within_ceiling { 1 } else { 2 });
    }
}
