//! Editing: transcript + context in, edit decision list out.
//!
//! Every cut is detected once on the shared clock and then emitted for each
//! track, so the builder can drop the stretch from the output entirely.
//! Cut ids are `<decision>/<track>`, e.g. `cut-0007/guest`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{format_clock, Stage, StageContext};
use crate::core::error::{AtStep, StageFailure};
use crate::domain::alignment::AlignmentMap;
use crate::domain::edl::{Chapter, CutOrigin, EditList, EditOperation};
use crate::domain::manifest::{ArtifactKey, Manifest, StageId};
use crate::domain::settings::EditingSettings;
use crate::domain::span::{ms_to_ticks, seconds_to_signed_ticks, ticks_to_seconds, TickSpan};
use crate::domain::timeline::{output_duration, TimelineRegion};
use crate::domain::transcript::normalize_word;
use crate::domain::{ContextDocument, Transcript};
use crate::timeline::{write_cmx3600, TimelineBuilder, TimelineError};

/// Single-word fillers with their base confidence
const FILLERS: &[(&str, f64)] = &[
    ("um", 0.95),
    ("umm", 0.95),
    ("uh", 0.95),
    ("uhh", 0.95),
    ("erm", 0.9),
    ("er", 0.85),
    ("ah", 0.8),
    ("hmm", 0.75),
    ("mm", 0.7),
];

/// Two-word fillers. These often carry meaning, so they start lower.
const FILLER_PHRASES: &[(&str, &str, f64)] = &[("you", "know", 0.55), ("i", "mean", 0.5)];

pub struct EditingStage;

/// One automated cut decision on the shared clock (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutDecision {
    pub id: String,
    pub origin: CutOrigin,
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
    pub applied: bool,
    pub requires_review: bool,
    pub rationale: String,
}

impl CutDecision {
    fn new(origin: CutOrigin, start: f64, end: f64, confidence: f64, applied: bool, rationale: String) -> Self {
        Self {
            id: String::new(),
            origin,
            start,
            end,
            confidence,
            applied,
            requires_review: !applied,
            rationale,
        }
    }

    fn seconds(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

#[async_trait]
impl Stage for EditingStage {
    fn id(&self) -> StageId {
        StageId::Editing
    }

    fn required_outputs(&self) -> Vec<ArtifactKey> {
        vec![
            ArtifactKey::Edl,
            ArtifactKey::EdlSidecar,
            ArtifactKey::EditRationale,
            ArtifactKey::ContentSummary,
        ]
    }

    #[instrument(skip_all, fields(stage = "editing"))]
    async fn run(&self, ctx: &mut StageContext) -> Result<(), StageFailure> {
        ctx.begin("load");
        let transcript: Transcript = ctx.read_json(ArtifactKey::Transcript).await?;
        let alignment: AlignmentMap = ctx.read_json(ArtifactKey::AlignmentMap).await?;
        let context: Option<ContextDocument> =
            ctx.read_optional_json(ArtifactKey::ContextDocument).await?;
        if context.is_none() {
            warn!("No context document, tangent detection and chapters skipped");
        }
        let lengths = track_lengths(ctx).await?;
        let settings = ctx.manifest.config.editing.clone();

        ctx.begin("fillers");
        let mut decisions = detect_fillers(&transcript, &settings);

        ctx.begin("silences");
        decisions.extend(detect_silences(&transcript, &settings));

        ctx.begin("tangents");
        if let Some(context) = &context {
            decisions.extend(detect_tangents(context, &settings));
        }
        number_decisions(&mut decisions);

        ctx.begin("budget");
        let budget = settings.auto_cut_budget.clamp(0.0, 1.0) * episode_seconds(&alignment, &lengths);
        let demoted = enforce_budget(&mut decisions, budget);
        if demoted > 0 {
            warn!(demoted, budget_s = budget, "Auto-cut budget exceeded, excess cuts need review");
        }

        ctx.begin("build");
        let operations = build_operations(&decisions, &lengths, &alignment);

        ctx.begin("validate");
        let outputs = finalize(&ctx.manifest, operations, &alignment, context.as_ref())
            .at_step(ctx.step())?;
        outputs.list.validate().map_err(|e| ctx.failure(e))?;

        ctx.begin("write");
        ctx.write_json(ArtifactKey::EdlSidecar, &outputs.list).await?;
        ctx.write_text(ArtifactKey::Edl, &outputs.cmx).await?;
        ctx.write_json(ArtifactKey::EditRationale, &decisions).await?;
        ctx.write_text(ArtifactKey::ContentSummary, &outputs.summary).await?;
        ctx.finish();

        info!(
            decisions = decisions.len(),
            applied = decisions.iter().filter(|d| d.applied).count(),
            regions = outputs.regions.len(),
            chapters = outputs.list.chapters.len(),
            "Editing finished"
        );
        Ok(())
    }
}

/// Track lengths in session ticks
async fn track_lengths(ctx: &StageContext) -> Result<BTreeMap<String, u64>, StageFailure> {
    let rate = ctx.sample_rate() as u128;
    let mut lengths = BTreeMap::new();
    for p in &ctx.manifest.episode.participants {
        let engine = ctx.providers.engine.clone();
        let path = ctx.track_path(p);
        let info = ctx
            .call("probe", |_| {
                let engine = engine.clone();
                let path = path.clone();
                async move { engine.probe(&path).await }
            })
            .await?;
        if info.sample_rate == 0 {
            return Err(ctx.invalid(format!("track for {} reports no sample rate", p.name)));
        }
        let ticks = info.frames as u128 * rate / info.sample_rate as u128;
        lengths.insert(p.name.clone(), ticks as u64);
    }
    Ok(lengths)
}

pub fn detect_fillers(transcript: &Transcript, settings: &EditingSettings) -> Vec<CutDecision> {
    let mut found = Vec::new();
    for segment in &transcript.segments {
        let words = &segment.words;
        let mut i = 0;
        while i < words.len() {
            let word = normalize_word(&words[i].text);

            if let Some(next) = words.get(i + 1) {
                let next_word = normalize_word(&next.text);
                let phrase = FILLER_PHRASES
                    .iter()
                    .find(|(a, b, _)| *a == word && *b == next_word);
                if let Some((a, b, base)) = phrase {
                    let confidence = base * words[i].confidence.min(next.confidence);
                    if next.end > words[i].start {
                        found.push(CutDecision::new(
                            CutOrigin::Filler,
                            words[i].start,
                            next.end,
                            confidence,
                            confidence >= settings.filler_sensitivity,
                            format!("Filler phrase \"{} {}\" ({})", a, b, segment.speaker),
                        ));
                    }
                    i += 2;
                    continue;
                }
            }

            if let Some((filler, base)) = FILLERS.iter().find(|(f, _)| *f == word) {
                let w = &words[i];
                let confidence = base * w.confidence;
                if w.end > w.start {
                    found.push(CutDecision::new(
                        CutOrigin::Filler,
                        w.start,
                        w.end,
                        confidence,
                        confidence >= settings.filler_sensitivity,
                        format!("Filler \"{}\" ({})", filler, segment.speaker),
                    ));
                }
            }
            i += 1;
        }
    }
    found
}

/// Pauses between consecutive speech longer than the minimum, shortened to
/// `silence_keep_ms` (split evenly around the cut)
pub fn detect_silences(transcript: &Transcript, settings: &EditingSettings) -> Vec<CutDecision> {
    let mut speech: Vec<(f64, f64)> = Vec::new();
    for segment in &transcript.segments {
        if segment.words.is_empty() {
            speech.push((segment.start, segment.end));
        } else {
            speech.extend(segment.words.iter().map(|w| (w.start, w.end)));
        }
    }
    let speech = merge_intervals(speech);

    let min_gap = settings.min_silence_ms as f64 / 1000.0;
    let keep = settings.silence_keep_ms as f64 / 1000.0;

    speech
        .windows(2)
        .filter_map(|pair| {
            let (gap_start, gap_end) = (pair[0].1, pair[1].0);
            let gap = gap_end - gap_start;
            if gap <= min_gap {
                return None;
            }
            let start = gap_start + keep / 2.0;
            let end = gap_end - keep / 2.0;
            (end > start).then(|| {
                CutDecision::new(
                    CutOrigin::Silence,
                    start,
                    end,
                    1.0,
                    true,
                    format!("Pause of {:.1}s shortened to {:.1}s", gap, keep.min(gap)),
                )
            })
        })
        .collect()
}

pub fn detect_tangents(context: &ContextDocument, settings: &EditingSettings) -> Vec<CutDecision> {
    context
        .tangents()
        .filter(|t| t.end > t.start)
        .map(|t| {
            let rationale = match &t.note {
                Some(note) => format!("Tangent: {}", note),
                None => "Tangent off the main topic".to_string(),
            };
            CutDecision::new(
                CutOrigin::Tangent,
                t.start,
                t.end,
                t.confidence,
                t.confidence >= settings.tangent_auto_cut_threshold,
                rationale,
            )
        })
        .collect()
}

/// Sort by position and assign `cut-NNNN` ids
fn number_decisions(decisions: &mut [CutDecision]) {
    decisions.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));
    for (i, d) in decisions.iter_mut().enumerate() {
        d.id = format!("cut-{:04}", i + 1);
    }
}

/// Keep at most `budget_seconds` of auto-applied cuts, most confident first.
/// Returns how many were demoted to proposals.
pub fn enforce_budget(decisions: &mut [CutDecision], budget_seconds: f64) -> usize {
    let mut order: Vec<usize> = (0..decisions.len())
        .filter(|&i| decisions[i].applied)
        .collect();
    order.sort_by(|&a, &b| decisions[b].confidence.total_cmp(&decisions[a].confidence));

    let mut covered: Vec<(f64, f64)> = Vec::new();
    let mut used = 0.0;
    let mut demoted = 0;

    for i in order {
        let d = &mut decisions[i];
        let overlap: f64 = covered
            .iter()
            .map(|&(s, e)| (e.min(d.end) - s.max(d.start)).max(0.0))
            .sum();
        let added = (d.seconds() - overlap).max(0.0);

        if used + added > budget_seconds {
            d.applied = false;
            d.requires_review = true;
            d.rationale.push_str(" (over auto-cut budget)");
            demoted += 1;
        } else {
            used += added;
            covered.push((d.start, d.end));
            covered = merge_intervals(std::mem::take(&mut covered));
        }
    }
    demoted
}

fn merge_intervals(mut spans: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    spans.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Length of the shared clock covered by any track
pub fn episode_seconds(alignment: &AlignmentMap, lengths: &BTreeMap<String, u64>) -> f64 {
    let mut start = i64::MAX;
    let mut end = i64::MIN;
    for (track, &len) in lengths {
        let offset = alignment.offset_for(track);
        start = start.min(offset);
        end = end.max(offset + len as i64);
    }
    if end <= start {
        return 0.0;
    }
    (end - start) as f64 / alignment.sample_rate.max(1) as f64
}

/// One whole-track keep per track, then every decision mapped onto each
/// track's own clock
pub fn build_operations(
    decisions: &[CutDecision],
    lengths: &BTreeMap<String, u64>,
    alignment: &AlignmentMap,
) -> Vec<EditOperation> {
    let rate = alignment.sample_rate;
    let mut operations: Vec<EditOperation> = lengths
        .iter()
        .filter(|(_, &len)| len > 0)
        .map(|(track, &len)| EditOperation::keep(format!("keep/{}", track), track, TickSpan::new(0, len)))
        .collect();

    for d in decisions {
        let start = seconds_to_signed_ticks(d.start, rate);
        let end = seconds_to_signed_ticks(d.end, rate);
        for (track, &len) in lengths {
            let offset = alignment.offset_for(track);
            let source_start = (start - offset).clamp(0, len as i64) as u64;
            let source_end = (end - offset).clamp(0, len as i64) as u64;
            if source_end <= source_start {
                continue;
            }

            let mut op = EditOperation::cut(
                format!("{}/{}", d.id, track),
                track,
                TickSpan::new(source_start, source_end),
            );
            op.applied = d.applied;
            op.requires_review = d.requires_review;
            op.origin = Some(d.origin);
            op.confidence = Some(d.confidence);
            op.rationale = Some(d.rationale.clone());
            operations.push(op);
        }
    }
    operations
}

/// Everything derived from an operation set
pub struct EditOutputs {
    pub list: EditList,
    pub regions: Vec<TimelineRegion>,
    pub cmx: String,
    pub summary: String,
}

/// Resolve `operations` through the timeline builder and render the sidecar,
/// portable list and show notes. Shared by the stage and gate `modify`.
pub fn finalize(
    manifest: &Manifest,
    operations: Vec<EditOperation>,
    alignment: &AlignmentMap,
    context: Option<&ContextDocument>,
) -> Result<EditOutputs, TimelineError> {
    let rate = manifest.sample_rate;
    let settings = &manifest.config.editing;
    let crossfade = ms_to_ticks(manifest.config.mixing.crossfade_ms, rate);
    let regions = TimelineBuilder::new(crossfade).build(&operations, alignment)?;

    let chapters = match context {
        Some(context) if settings.generate_chapters => chapters(context, &regions, alignment, rate),
        _ => Vec::new(),
    };

    let list = EditList {
        sample_rate: rate,
        frame_rate: settings.edl_frame_rate,
        operations,
        chapters,
    };
    let cmx = write_cmx3600(&manifest.episode.title, &regions, rate, settings.edl_frame_rate);
    let summary = show_notes(manifest, context, &list, &regions, alignment);

    Ok(EditOutputs {
        list,
        regions,
        cmx,
        summary,
    })
}

/// Position of a shared-clock tick on the output clock. A tick that was cut
/// lands where the next kept audio starts.
pub fn map_to_output(regions: &[TimelineRegion], alignment: &AlignmentMap, tick: i64) -> u64 {
    let mut next: Option<u64> = None;
    for r in regions {
        let start = r.source.start as i64 + alignment.offset_for(&r.track);
        let end = start + r.source.len() as i64;
        if (start..end).contains(&tick) {
            return r.output.start + (tick - start) as u64;
        }
        if start > tick {
            next = Some(next.map_or(r.output.start, |n| n.min(r.output.start)));
        }
    }
    next.unwrap_or_else(|| output_duration(regions))
}

/// Chapters from context topics, placed on the output clock
pub fn chapters(
    context: &ContextDocument,
    regions: &[TimelineRegion],
    alignment: &AlignmentMap,
    rate: u32,
) -> Vec<Chapter> {
    let end = output_duration(regions);
    let mut chapters: Vec<Chapter> = Vec::new();
    for topic in &context.topics {
        let out = map_to_output(regions, alignment, seconds_to_signed_ticks(topic.start, rate));
        if out >= end && end > 0 {
            continue;
        }
        let start_seconds = ticks_to_seconds(out, rate);
        // A topic swallowed by a cut collapses onto its neighbour
        if chapters.last().is_some_and(|c| c.start_seconds >= start_seconds) {
            continue;
        }
        chapters.push(Chapter {
            title: topic.title.clone(),
            start_seconds,
        });
    }
    chapters
}

/// Markdown show notes
pub fn show_notes(
    manifest: &Manifest,
    context: Option<&ContextDocument>,
    list: &EditList,
    regions: &[TimelineRegion],
    alignment: &AlignmentMap,
) -> String {
    let episode = &manifest.episode;
    let rate = manifest.sample_rate;
    let mut out = String::new();

    out.push_str(&format!("# {}\n\n", episode.title));
    out.push_str(&format!("*{}, episode {}*", episode.show, episode.episode_number));
    if let Some(date) = episode.recording_date {
        out.push_str(&format!(" (recorded {})", date));
    }
    out.push_str("\n\n");

    let names: Vec<&str> = episode.participants.iter().map(|p| p.name.as_str()).collect();
    out.push_str(&format!("With {}\n\n", names.join(", ")));
    out.push_str(&format!(
        "Duration: {}\n",
        format_clock(ticks_to_seconds(output_duration(regions), rate))
    ));

    if !list.chapters.is_empty() {
        out.push_str("\n## Chapters\n\n");
        for c in &list.chapters {
            out.push_str(&format!("- [{}] {}\n", format_clock(c.start_seconds), c.title));
        }
    }

    if let Some(context) = context {
        if !context.topics.is_empty() {
            out.push_str("\n## Topics\n\n");
            for t in &context.topics {
                match &t.summary {
                    Some(summary) => out.push_str(&format!("- **{}**: {}\n", t.title, summary)),
                    None => out.push_str(&format!("- **{}**\n", t.title)),
                }
            }
        }
        if !context.key_quotes.is_empty() {
            out.push_str("\n## Key quotes\n\n");
            for q in &context.key_quotes {
                let at = map_to_output(regions, alignment, seconds_to_signed_ticks(q.start, rate));
                out.push_str(&format!(
                    "> \"{}\"\n> {} [{}]\n\n",
                    q.text,
                    q.speaker,
                    format_clock(ticks_to_seconds(at, rate))
                ));
            }
        }
    }

    out
}
