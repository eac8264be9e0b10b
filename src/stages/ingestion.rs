//! Ingestion: tracks in, transcript + alignment map (+ context) out.
//!
//! validate -> transcribe -> diarize -> align -> merge -> context -> write

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{format_clock, Stage, StageContext};
use crate::adapters::{AnalysisChunk, AudioInfo, TranscriptionRequest};
use crate::align::{align_all, AlignJob, AlignerSettings, SignalAligner};
use crate::core::error::StageFailure;
use crate::domain::alignment::{AlignmentMap, AlignmentResult};
use crate::domain::manifest::{ArtifactKey, Participant, StageId};
use crate::domain::{ContextDocument, Transcript};

pub struct IngestionStage;

#[async_trait]
impl Stage for IngestionStage {
    fn id(&self) -> StageId {
        StageId::Ingestion
    }

    fn required_outputs(&self) -> Vec<ArtifactKey> {
        vec![ArtifactKey::Transcript, ArtifactKey::AlignmentMap]
    }

    #[instrument(skip_all, fields(stage = "ingestion"))]
    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure> {
        let participants = ctx.manifest.episode.participants.clone();

        ctx.begin("validate");
        let infos = validate_tracks(ctx, &participants).await?;

        ctx.begin("transcribe");
        let mut transcripts = BTreeMap::new();
        for p in &participants {
            let transcript = transcribe_track(ctx, p).await?;
            info!(
                track = %p.name,
                segments = transcript.segments.len(),
                words = transcript.word_count(),
                "Track transcribed"
            );
            transcripts.insert(p.name.clone(), transcript);
        }

        ctx.begin("diarize");
        for p in &participants {
            let Some(transcript) = transcripts.remove(&p.name) else {
                continue;
            };
            let diarizer = ctx.providers.diarizer.clone();
            let path = ctx.track_path(p);
            let name = p.name.clone();
            let labelled = ctx
                .call("diarize", |_| {
                    let diarizer = diarizer.clone();
                    let path = path.clone();
                    let transcript = transcript.clone();
                    let name = name.clone();
                    async move { diarizer.diarize(&path, transcript, &name).await }
                })
                .await?;
            transcripts.insert(p.name.clone(), labelled);
        }

        ctx.begin("align");
        let alignment = align_tracks(ctx, &participants, &infos, &transcripts).await?;

        ctx.begin("merge");
        let merged = merge_transcripts(&alignment, transcripts);
        merged
            .validate()
            .map_err(|e| ctx.failure(format!("merged transcript is inconsistent: {}", e)))?;

        ctx.begin("context");
        let context = extract_context(ctx, &merged).await;

        ctx.begin("write");
        ctx.write_json(ArtifactKey::Transcript, &merged).await?;
        ctx.write_json(ArtifactKey::AlignmentMap, &alignment).await?;
        if let Some(context) = &context {
            ctx.write_json(ArtifactKey::ContextDocument, context).await?;
        }
        ctx.finish();

        info!(
            segments = merged.segments.len(),
            words = merged.word_count(),
            review = alignment.requires_review(),
            context = context.is_some(),
            "Ingestion finished"
        );
        Ok(())
    }
}

/// Every track must exist and carry audio
async fn validate_tracks(
    ctx: &StageContext,
    participants: &[Participant],
) -> Result<BTreeMap<String, AudioInfo>, StageFailure> {
    let mut infos = BTreeMap::new();
    for p in participants {
        let path = ctx.track_path(p);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ctx.invalid(format!("track for {} not found: {}", p.name, path.display())));
        }

        let engine = ctx.providers.engine.clone();
        let info = ctx
            .call("probe", |_| {
                let engine = engine.clone();
                let path = path.clone();
                async move { engine.probe(&path).await }
            })
            .await?;

        if info.sample_rate == 0 || info.frames == 0 {
            return Err(ctx.invalid(format!("track for {} contains no audio", p.name)));
        }
        if info.sample_rate < ctx.manifest.config.ingestion.analysis_rate {
            warn!(
                track = %p.name,
                rate = info.sample_rate,
                "Track sample rate is below the alignment analysis rate"
            );
        }
        infos.insert(p.name.clone(), info);
    }
    Ok(infos)
}

async fn transcribe_track(ctx: &StageContext, p: &Participant) -> Result<Transcript, StageFailure> {
    let settings = &ctx.manifest.config.ingestion;
    let request = TranscriptionRequest {
        model: settings.transcription_model.clone(),
        language: settings.language.clone(),
        speaker: p.name.clone(),
    };
    let transcriber = ctx.providers.transcriber.clone();
    let path = ctx.track_path(p);

    let transcript = ctx
        .call("transcribe", |timeout| {
            let transcriber = transcriber.clone();
            let path = path.clone();
            let request = request.clone();
            async move { transcriber.transcribe(&path, &request, timeout).await }
        })
        .await?;

    transcript
        .validate()
        .map_err(|e| ctx.invalid(format!("transcript for {} is malformed: {}", p.name, e)))?;
    Ok(transcript)
}

/// The host track is the reference clock; every other track is aligned to it
async fn align_tracks(
    ctx: &StageContext,
    participants: &[Participant],
    infos: &BTreeMap<String, AudioInfo>,
    transcripts: &BTreeMap<String, Transcript>,
) -> Result<AlignmentMap, StageFailure> {
    let settings = AlignerSettings::from(&ctx.manifest.config.ingestion);
    let session_rate = ctx.sample_rate();
    let reference = ctx
        .manifest
        .episode
        .host()
        .or_else(|| participants.first())
        .ok_or_else(|| ctx.invalid("episode has no participants"))?
        .clone();

    let mut map = AlignmentMap {
        reference_track: reference.name.clone(),
        sample_rate: session_rate,
        threshold: settings.threshold,
        tracks: vec![AlignmentResult::reference(&reference.name, session_rate)],
    };
    if participants.len() < 2 {
        info!("Single track, no alignment needed");
        return Ok(map);
    }

    let decode = |p: &Participant| {
        let engine = ctx.providers.engine.clone();
        let path = ctx.track_path(p);
        let rate = settings.analysis_rate.min(
            infos
                .get(&p.name)
                .map(|i| i.sample_rate)
                .unwrap_or(settings.analysis_rate),
        );
        async move {
            ctx.call("decode", |_| {
                let engine = engine.clone();
                let path = path.clone();
                async move { engine.decode(&path, rate).await }
            })
            .await
        }
    };

    let reference_audio = Arc::new(decode(&reference).await?);
    let mut jobs = Vec::new();
    for p in participants.iter().filter(|p| p.name != reference.name) {
        jobs.push(AlignJob {
            track: p.name.clone(),
            audio: Arc::new(decode(p).await?),
            transcript: transcripts.get(&p.name).cloned().map(Arc::new),
        });
    }

    let aligner = Arc::new(SignalAligner::new(settings, session_rate));
    let results = align_all(
        aligner,
        reference_audio,
        transcripts.get(&reference.name).cloned().map(Arc::new),
        jobs,
        ctx.limits.workers,
    )
    .await
    .map_err(|e| ctx.failure(format!("alignment worker failed: {}", e)))?;

    for result in &results {
        if result.requires_review {
            warn!(
                track = %result.track,
                confidence = result.confidence,
                method = ?result.method,
                drift = result.drift_warning,
                "Alignment needs human review"
            );
        } else {
            info!(
                track = %result.track,
                offset_s = result.offset_seconds(),
                confidence = result.confidence,
                "Track aligned"
            );
        }
    }
    map.tracks.extend(results);
    map.validate().map_err(|e| ctx.failure(e))?;
    Ok(map)
}

/// Shift every track's transcript onto the reference clock and interleave
pub fn merge_transcripts(alignment: &AlignmentMap, transcripts: BTreeMap<String, Transcript>) -> Transcript {
    let parts = transcripts
        .into_iter()
        .map(|(track, t)| {
            let offset = alignment
                .get(&track)
                .map(AlignmentResult::offset_seconds)
                .unwrap_or(0.0);
            t.shifted(offset)
        })
        .collect();
    Transcript::merge(parts)
}

/// Cut the merged transcript into analysis chunks of `chunk_seconds`
pub fn analysis_chunks(transcript: &Transcript, chunk_seconds: f64) -> Vec<AnalysisChunk> {
    let chunk_seconds = chunk_seconds.max(1.0);
    let mut chunks: Vec<AnalysisChunk> = Vec::new();

    for segment in &transcript.segments {
        let index = (segment.start / chunk_seconds).floor() as usize;
        let line = format!("[{}] {}: {}\n", format_clock(segment.start), segment.speaker, segment.text);
        match chunks.last_mut() {
            Some(chunk) if chunk.index == index => {
                chunk.text.push_str(&line);
                chunk.end_seconds = chunk.end_seconds.max(segment.end);
            }
            _ => chunks.push(AnalysisChunk {
                index,
                start_seconds: segment.start,
                end_seconds: segment.end,
                text: line,
            }),
        }
    }
    chunks
}

/// Run semantic analysis; any failure degrades to "no context"
async fn extract_context(ctx: &StageContext, transcript: &Transcript) -> Option<ContextDocument> {
    let analyzer = ctx.providers.analyzer.clone();
    if !analyzer.is_enabled() {
        warn!("No semantic analysis service configured, continuing without context");
        return None;
    }

    let chunk_seconds = ctx.manifest.config.ingestion.analysis_chunk_minutes as f64 * 60.0;
    let chunks = analysis_chunks(transcript, chunk_seconds);
    let mut documents = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let result = ctx
            .call("analyze", |timeout| {
                let analyzer = analyzer.clone();
                let chunk = chunk.clone();
                async move { analyzer.analyze(&chunk, timeout).await }
            })
            .await;
        match result {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                warn!(chunk = chunk.index, error = %e, "Context extraction failed, continuing without context");
                return None;
            }
        }
    }

    let merged = ContextDocument::merge(documents);
    if let Err(e) = merged.validate() {
        warn!(error = %e, "Discarding malformed context document");
        return None;
    }
    (!merged.is_empty()).then_some(merged)
}
