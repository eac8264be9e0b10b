//! Gate Controller.
//!
//! Turns a completed stage's artifacts into a review report and applies the
//! human decision to the manifest. This is the only place outside the
//! orchestrator that changes stage records, and every decision is
//! idempotent: applying it twice leaves the session as applying it once.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};

use super::store::{write_atomic, SessionStore};
use crate::domain::alignment::AlignmentMap;
use crate::domain::edl::{EditList, OperationPatch};
use crate::domain::gate::{GateAction, GateDecision, GateReport, ReviewItem, ReviewStatus};
use crate::domain::manifest::{ArtifactKey, GateOutcome, Manifest, StageId, StageStatus};
use crate::domain::span::ticks_to_seconds;
use crate::domain::{ContextDocument, Transcript};
use crate::stages::editing::finalize;
use crate::stages::mastering::MasteringMetadata;
use crate::timeline::MixLog;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("No stage is waiting for a gate decision")]
    NoPendingGate,

    #[error("Stage {stage} is {status} with gate {gate}; it cannot take this decision")]
    NotAwaiting {
        stage: StageId,
        status: StageStatus,
        gate: GateOutcome,
    },

    #[error("Stage {0} has no editable output; only editing accepts modify")]
    NotEditable(StageId),

    #[error("Cannot reject {stage} back to the later stage {target}")]
    IllegalTarget { stage: StageId, target: StageId },

    #[error("Invalid edit patch: {0}")]
    Patch(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Whether a decision changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEffect {
    Applied,
    NoChange,
}

pub struct GateController {
    store: SessionStore,
}

impl GateController {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    async fn read_artifact<T: DeserializeOwned>(&self, manifest: &Manifest, key: ArtifactKey) -> anyhow::Result<T> {
        let path = self.store.resolve(&manifest.artifact_path(key));
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed {}", path.display()))
    }

    async fn read_optional<T: DeserializeOwned>(
        &self,
        manifest: &Manifest,
        key: ArtifactKey,
    ) -> anyhow::Result<Option<T>> {
        let path = self.store.resolve(&manifest.artifact_path(key));
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read_artifact(manifest, key).await.map(Some)
    }

    /// Review report for a completed stage
    pub async fn present(&self, manifest: &Manifest, stage: StageId) -> Result<GateReport, GateError> {
        let record = manifest.stage(stage);
        if record.status != StageStatus::Completed {
            return Err(GateError::NotAwaiting {
                stage,
                status: record.status,
                gate: record.gate,
            });
        }

        let report = match stage {
            StageId::Ingestion => self.ingestion_report(manifest).await?,
            StageId::Editing => self.editing_report(manifest).await?,
            StageId::Mixing => self.mixing_report(manifest).await?,
            StageId::Mastering => self.mastering_report(manifest).await?,
        };
        Ok(report)
    }

    /// Report for the first stage awaiting a decision
    pub async fn present_pending(&self, manifest: &Manifest) -> Result<GateReport, GateError> {
        let stage = manifest.pending_gate().ok_or(GateError::NoPendingGate)?;
        self.present(manifest, stage).await
    }

    async fn ingestion_report(&self, manifest: &Manifest) -> anyhow::Result<GateReport> {
        let transcript: Transcript = self.read_artifact(manifest, ArtifactKey::Transcript).await?;
        let alignment: AlignmentMap = self.read_artifact(manifest, ArtifactKey::AlignmentMap).await?;
        let context: Option<ContextDocument> =
            self.read_optional(manifest, ArtifactKey::ContextDocument).await?;

        let mut summary = vec![
            format!(
                "{} segments, {} words, {:.0}s",
                transcript.segments.len(),
                transcript.word_count(),
                transcript.duration_seconds
            ),
            format!("Reference track: {}", alignment.reference_track),
        ];
        summary.push(match &context {
            Some(c) => format!(
                "Context: {} topics, {} tangent candidates",
                c.topics.len(),
                c.tangents().count()
            ),
            None => "Context: unavailable, editing runs without tangents and chapters".to_string(),
        });

        let items = alignment
            .tracks
            .iter()
            .filter(|r| r.track != alignment.reference_track)
            .map(|r| {
                let mut rationale = format!(
                    "{:?} offset {:+.1} ms after {} attempt(s)",
                    r.method,
                    r.offset_seconds() * 1000.0,
                    r.attempts.len()
                );
                if r.drift_warning {
                    rationale.push_str(", clock drift detected");
                }
                ReviewItem {
                    subject: r.track.clone(),
                    status: if r.requires_review {
                        ReviewStatus::RequiresApproval
                    } else {
                        ReviewStatus::AutoApplied
                    },
                    confidence: Some(r.confidence),
                    rationale,
                }
            })
            .collect();

        Ok(GateReport {
            stage: StageId::Ingestion,
            summary,
            items,
        })
    }

    async fn editing_report(&self, manifest: &Manifest) -> anyhow::Result<GateReport> {
        let list: EditList = self.read_artifact(manifest, ArtifactKey::EdlSidecar).await?;
        let rate = list.sample_rate;

        // One item per decision group, not per track
        let mut items: Vec<ReviewItem> = Vec::new();
        for op in list.operations.iter().filter(|op| op.origin.is_some()) {
            let group = op.id.split('/').next().unwrap_or(op.id.as_str());
            if items.last().is_some_and(|i| i.subject == group) {
                continue;
            }
            let (start, end) = op.span.seconds(rate);
            items.push(ReviewItem {
                subject: group.to_string(),
                status: if op.applied && !op.requires_review {
                    ReviewStatus::AutoApplied
                } else {
                    ReviewStatus::RequiresApproval
                },
                confidence: op.confidence,
                rationale: format!(
                    "{} [{:.2}s, {:.2}s on {}]",
                    op.rationale.as_deref().unwrap_or("manual cut"),
                    start,
                    end,
                    op.track
                ),
            });
        }

        let applied = items.iter().filter(|i| i.status == ReviewStatus::AutoApplied).count();
        let summary = vec![
            format!("{} operations, {} cut decisions", list.operations.len(), items.len()),
            format!("{} applied, {} awaiting approval", applied, items.len() - applied),
            format!("{} chapters", list.chapters.len()),
        ];

        Ok(GateReport {
            stage: StageId::Editing,
            summary,
            items,
        })
    }

    async fn mixing_report(&self, manifest: &Manifest) -> anyhow::Result<GateReport> {
        let log: MixLog = self.read_artifact(manifest, ArtifactKey::MixingLog).await?;

        let mut summary = vec![
            format!(
                "{} regions, {:.1}s, {} crossfades",
                log.region_count, log.output_duration_seconds, log.crossfades
            ),
            format!(
                "Primary speaker: {}, {} ducked spans",
                log.primary_track.as_deref().unwrap_or("none"),
                log.ducking.len()
            ),
            format!("Processing chain: {}", log.processing_chain.join(" -> ")),
        ];
        for bed in &log.music_beds {
            summary.push(format!(
                "Music {}: {} at tick {} for {} ticks",
                bed.position.as_str(),
                bed.file,
                bed.start_ticks,
                bed.duration_ticks
            ));
        }

        let items = log
            .degradations
            .iter()
            .map(|d| ReviewItem {
                subject: d.region.clone(),
                status: ReviewStatus::AutoApplied,
                confidence: None,
                rationale: format!("{} skipped: {}", d.step, d.error),
            })
            .collect();

        Ok(GateReport {
            stage: StageId::Mixing,
            summary,
            items,
        })
    }

    async fn mastering_report(&self, manifest: &Manifest) -> anyhow::Result<GateReport> {
        let meta: MasteringMetadata = self.read_artifact(manifest, ArtifactKey::Metadata).await?;

        let summary = vec![
            format!(
                "Loudness {:.1} LUFS -> {:.1} LUFS (target {:.1})",
                meta.loudness_before.integrated_lufs,
                meta.loudness_after.integrated_lufs,
                meta.target.integrated_lufs
            ),
            format!(
                "True peak {:.1} dBTP (ceiling {:.1})",
                meta.loudness_after.true_peak_dbtp, meta.target.true_peak_dbtp
            ),
            format!("{:.1}s, {} chapters", meta.duration_seconds, meta.chapters.len()),
            if meta.verification.passed {
                "Verification passed".to_string()
            } else {
                format!("Verification failed ({} checks)", meta.verification.warnings.len())
            },
        ];

        let mut items: Vec<ReviewItem> = meta
            .verification
            .warnings
            .iter()
            .map(|w| ReviewItem {
                subject: "verification".to_string(),
                status: ReviewStatus::RequiresApproval,
                confidence: None,
                rationale: w.clone(),
            })
            .collect();
        items.extend(meta.files.iter().map(|(name, bytes)| ReviewItem {
            subject: name.clone(),
            status: ReviewStatus::AutoApplied,
            confidence: None,
            rationale: format!("{} bytes", bytes),
        }));

        Ok(GateReport {
            stage: StageId::Mastering,
            summary,
            items,
        })
    }

    /// Record `decision` in the manifest and persist it
    #[instrument(skip_all, fields(stage = %decision.stage))]
    pub async fn apply(&self, manifest: &mut Manifest, decision: &GateDecision) -> Result<GateEffect, GateError> {
        let effect = match &decision.action {
            GateAction::Approve => self.approve(manifest, decision)?,
            GateAction::Reject { target } => {
                let target = target.unwrap_or(decision.stage);
                self.reject(manifest, decision, target).await?
            }
            GateAction::Modify { patch } => self.modify(manifest, decision, patch).await?,
        };
        if effect == GateEffect::NoChange {
            info!("Decision already in effect");
        }
        Ok(effect)
    }

    fn approve(&self, manifest: &mut Manifest, decision: &GateDecision) -> Result<GateEffect, GateError> {
        let record = manifest.stage_mut(decision.stage);
        if record.is_approved() {
            return Ok(GateEffect::NoChange);
        }
        if !record.awaiting_gate() {
            return Err(not_awaiting(manifest, decision.stage));
        }

        record.gate = GateOutcome::Approved;
        record.gate_decided_at = Some(Utc::now());
        record.gate_notes = decision.notes.clone();
        manifest.refresh_current_stage();
        self.store.save(manifest)?;

        info!(next = %manifest.current_stage, "Stage approved");
        Ok(GateEffect::Applied)
    }

    async fn reject(
        &self,
        manifest: &mut Manifest,
        decision: &GateDecision,
        target: StageId,
    ) -> Result<GateEffect, GateError> {
        let stage = decision.stage;
        if target > stage {
            return Err(GateError::IllegalTarget { stage, target });
        }

        let already = {
            let t = manifest.stage(target);
            t.status == StageStatus::Pending
                && t.gate == GateOutcome::Rejected
                && target.and_later().skip(1).all(|s| {
                    let r = manifest.stage(s);
                    r.status == StageStatus::Pending && r.gate == GateOutcome::Unset
                })
        };
        if already {
            return Ok(GateEffect::NoChange);
        }

        let status = manifest.stage(stage).status;
        if !matches!(status, StageStatus::Completed | StageStatus::Failed) {
            return Err(not_awaiting(manifest, stage));
        }

        for s in target.and_later() {
            manifest.stage_mut(s).reset();
        }
        let record = manifest.stage_mut(target);
        record.gate = GateOutcome::Rejected;
        record.gate_decided_at = Some(Utc::now());
        record.gate_notes = decision.notes.clone();
        manifest.refresh_current_stage();
        self.store.save(manifest)?;

        // Outputs go only after the manifest no longer points at them
        for s in target.and_later() {
            self.store.discard(s).await?;
        }

        info!(%target, "Stage rejected, pipeline rewound");
        Ok(GateEffect::Applied)
    }

    async fn modify(
        &self,
        manifest: &mut Manifest,
        decision: &GateDecision,
        patch: &OperationPatch,
    ) -> Result<GateEffect, GateError> {
        let stage = decision.stage;
        if stage != StageId::Editing {
            return Err(GateError::NotEditable(stage));
        }
        if manifest.stage(stage).status != StageStatus::Completed {
            return Err(not_awaiting(manifest, stage));
        }

        let mut list: EditList = self.read_artifact(manifest, ArtifactKey::EdlSidecar).await?;
        let changed = list.apply_patch(patch).map_err(GateError::Patch)?;
        if changed == 0 && manifest.stage(stage).is_approved() {
            return Ok(GateEffect::NoChange);
        }

        let alignment: AlignmentMap = self.read_artifact(manifest, ArtifactKey::AlignmentMap).await?;
        let context: Option<ContextDocument> =
            self.read_optional(manifest, ArtifactKey::ContextDocument).await?;
        let outputs = finalize(manifest, list.operations, &alignment, context.as_ref())
            .map_err(|e| GateError::Patch(e.to_string()))?;

        // Rewrite the editing outputs as one unit
        let staging = self.store.create_staging(stage).await?;
        let rewritten = async {
            copy_dir_files(&self.store.stage_dir(stage), &staging).await?;
            let sidecar = serde_json::to_string_pretty(&outputs.list).context("Failed to serialize edit list")?;
            write_atomic(&staging.join(ArtifactKey::EdlSidecar.file_name()), sidecar.as_bytes())?;
            write_atomic(&staging.join(ArtifactKey::Edl.file_name()), outputs.cmx.as_bytes())?;
            write_atomic(&staging.join(ArtifactKey::ContentSummary.file_name()), outputs.summary.as_bytes())?;
            self.store.promote(&staging, stage).await
        }
        .await;
        let checksums = match rewritten {
            Ok(checksums) => checksums,
            Err(e) => {
                if let Err(cleanup) = self.store.discard_staging(&staging).await {
                    warn!(error = %cleanup, "Failed to remove staging directory");
                }
                return Err(e.into());
            }
        };

        let record = manifest.stage_mut(stage);
        record.artifact_checksums = checksums;
        record.gate = GateOutcome::Approved;
        record.gate_decided_at = Some(Utc::now());
        record.gate_notes = decision.notes.clone();

        let later: Vec<StageId> = stage.and_later().skip(1).collect();
        for &s in &later {
            manifest.stage_mut(s).reset();
        }
        manifest.refresh_current_stage();
        self.store.save(manifest)?;
        for s in later {
            self.store.discard(s).await?;
        }

        let duration = ticks_to_seconds(
            crate::domain::timeline::output_duration(&outputs.regions),
            manifest.sample_rate,
        );
        info!(changed, regions = outputs.regions.len(), duration_s = duration, "Edit list modified and approved");
        Ok(GateEffect::Applied)
    }
}

fn not_awaiting(manifest: &Manifest, stage: StageId) -> GateError {
    let record = manifest.stage(stage);
    GateError::NotAwaiting {
        stage,
        status: record.status,
        gate: record.gate,
    }
}

async fn copy_dir_files(from: &Path, to: &Path) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(from)
        .await
        .with_context(|| format!("Failed to read {}", from.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))
                .await
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
