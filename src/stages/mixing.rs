//! Mixing: edit list + tracks in, one mixed stream out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{Stage, StageContext};
use crate::adapters::{AudioBuffer, EncodeFormat};
use crate::core::error::{AtStep, StageFailure};
use crate::domain::alignment::AlignmentMap;
use crate::domain::edl::EditList;
use crate::domain::manifest::{ArtifactKey, StageId};
use crate::domain::span::ms_to_ticks;
use crate::timeline::music::{append_outro, lay_intro};
use crate::timeline::{
    BedPosition, Degradation, EditExecutor, ExecutorSettings, MixOutput, MusicBed, TimelineBuilder,
};

pub struct MixingStage;

#[async_trait]
impl Stage for MixingStage {
    fn id(&self) -> StageId {
        StageId::Mixing
    }

    fn required_outputs(&self) -> Vec<ArtifactKey> {
        vec![ArtifactKey::MixedAudio, ArtifactKey::MixingLog]
    }

    #[instrument(skip_all, fields(stage = "mixing"))]
    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure> {
        ctx.begin("load");
        let list: EditList = ctx.read_json(ArtifactKey::EdlSidecar).await?;
        let alignment: AlignmentMap = ctx.read_json(ArtifactKey::AlignmentMap).await?;
        let rate = ctx.sample_rate();
        if list.sample_rate != rate || alignment.sample_rate != rate {
            return Err(ctx.failure(format!(
                "edit list ({} Hz) and alignment ({} Hz) disagree with the session rate {} Hz",
                list.sample_rate, alignment.sample_rate, rate
            )));
        }
        let settings = ctx.manifest.config.mixing.clone();

        ctx.begin("timeline");
        let regions = TimelineBuilder::new(ms_to_ticks(settings.crossfade_ms, rate))
            .build(&list.operations, &alignment)
            .at_step(ctx.step())?;
        if regions.is_empty() {
            return Err(ctx.invalid("edit list keeps no audio"));
        }

        ctx.begin("execute");
        let episode = &ctx.manifest.episode;
        let tracks: BTreeMap<String, PathBuf> = episode
            .participants
            .iter()
            .map(|p| (p.name.clone(), ctx.track_path(p)))
            .collect();
        let primary = settings
            .primary_speaker
            .clone()
            .or_else(|| episode.host().map(|p| p.name.clone()));
        if let Some(primary) = &primary {
            if !tracks.contains_key(primary) {
                return Err(ctx.invalid(format!("primary speaker '{}' is not a participant", primary)));
            }
        }

        let engine = ctx.providers.engine.clone();
        let executor = EditExecutor::new(
            engine.clone(),
            ExecutorSettings::from_mixing(&settings, rate, primary, ctx.limits.workers),
        );
        let output = executor.execute(&regions, &tracks).await.at_step(ctx.step())?;
        for d in &output.log.degradations {
            warn!(region = %d.region, hook = %d.step, error = %d.error, "Region processed without hook");
        }
        let MixOutput { audio, mut log } = output;
        let mut samples = audio.samples;

        ctx.begin("music");
        let beds = [
            (BedPosition::Intro, settings.music.intro.clone()),
            (BedPosition::Outro, settings.music.outro.clone()),
        ];
        let gain = 10f64.powf(settings.music.volume_db / 20.0) as f32;
        let fade = ms_to_ticks(settings.music.fade_ms, rate) as usize;
        for (position, file) in beds {
            let Some(file) = file else { continue };
            let bed = match decode_bed(ctx, &file).await {
                Ok(bed) => bed,
                Err(error) => {
                    // A missing or unreadable bed never blocks the episode
                    warn!(bed = position.as_str(), file = %file.display(), %error, "Music bed skipped");
                    log.degradations.push(Degradation {
                        region: format!("music/{}", position.as_str()),
                        step: "music".to_string(),
                        error,
                    });
                    continue;
                }
            };
            let (start_ticks, duration_ticks) = match position {
                BedPosition::Intro => (0, lay_intro(&mut samples, &bed, gain, fade)),
                BedPosition::Outro => (append_outro(&mut samples, &bed, gain, fade), bed.len() as u64),
            };
            info!(bed = position.as_str(), file = %file.display(), start_ticks, duration_ticks, "Music bed placed");
            log.music_beds.push(MusicBed {
                position,
                file: file.display().to_string(),
                start_ticks,
                duration_ticks,
            });
        }
        log.output_duration_ticks = samples.len() as u64;
        log.output_duration_seconds = samples.len() as f64 / rate as f64;

        ctx.begin("encode");
        let format = EncodeFormat::Wav {
            bits_per_sample: settings.output_bit_depth,
        };
        if !engine.supports(format) {
            return Err(ctx.invalid(format!(
                "{} cannot write {}-bit WAV",
                engine.name(),
                settings.output_bit_depth
            )));
        }
        let audio = Arc::new(AudioBuffer::new(samples, rate));
        let path = ctx.output_path(ArtifactKey::MixedAudio);
        ctx.call("encode", |_| {
            let engine = engine.clone();
            let audio = audio.clone();
            let path = path.clone();
            async move { engine.encode(&audio, &path, format).await }
        })
        .await?;

        ctx.begin("log");
        ctx.write_json(ArtifactKey::MixingLog, &log).await?;
        ctx.finish();

        info!(
            regions = log.region_count,
            duration_s = log.output_duration_seconds,
            ducked = log.ducking.len(),
            beds = log.music_beds.len(),
            "Mixing finished"
        );
        Ok(())
    }
}

/// Decode a music bed at the session rate; errors come back as text for the log
async fn decode_bed(ctx: &StageContext, file: &Path) -> Result<Vec<f32>, String> {
    let path = ctx.session_dir.join(file);
    if !path.is_file() {
        return Err(format!("{} not found", path.display()));
    }
    let engine = ctx.providers.engine.clone();
    let rate = ctx.sample_rate();
    let audio = ctx
        .call("decode", |_| {
            let engine = engine.clone();
            let path = path.clone();
            async move { engine.decode(&path, rate).await }
        })
        .await
        .map_err(|e| e.message)?;
    if audio.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }
    Ok(audio.samples)
}
