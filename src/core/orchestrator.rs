//! Pipeline Orchestrator.
//!
//! Drives the stages of one session in order:
//! - a stage runs only once every earlier stage is completed and approved
//! - outputs are written to a staging directory and promoted as a unit,
//!   then the manifest records the checkpoint (write-temp-then-rename)
//! - every completed stage stops the pipeline at its human gate
//! - a failure is classified and recorded; nothing after it runs

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::error::StageFailure;
use super::gate::{GateController, GateEffect, GateError};
use super::resources::check_disk;
use super::retry::RetryPolicy;
use super::store::SessionStore;
use crate::adapters::Providers;
use crate::config::Limits;
use crate::domain::gate::{GateDecision, GateReport};
use crate::domain::manifest::{ArtifactKey, CurrentStage, Manifest, StageId, StageStatus};
use crate::stages::{default_stages, Stage, StageContext};

/// Where a `run` stopped
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// A stage completed and waits for a human decision
    AwaitingGate(GateReport),
    Failed { stage: StageId, error: StageFailure },
    /// Every stage is completed and approved
    Complete,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    store: SessionStore,
    providers: Providers,
    retry: RetryPolicy,
    limits: Limits,
    stages: Vec<Arc<dyn Stage>>,
}

impl Orchestrator {
    pub fn new(store: SessionStore, providers: Providers, retry: RetryPolicy, limits: Limits) -> Self {
        Self {
            store,
            providers,
            retry,
            limits,
            stages: default_stages(),
        }
    }

    /// Replace the stage set (one per `StageId`, in order)
    pub fn with_stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn gates(&self) -> GateController {
        GateController::new(self.store.clone())
    }

    /// Run from the current position until a gate, a failure or the end
    #[instrument(skip_all, fields(episode = %manifest.episode.id))]
    pub async fn run(&self, manifest: &mut Manifest) -> Result<RunOutcome> {
        self.store.sweep_stale().await?;
        self.recover_interrupted(manifest)?;

        for stage in &self.stages {
            let id = stage.id();
            let record = manifest.stage(id);

            if record.is_approved() {
                continue;
            }
            if record.awaiting_gate() {
                info!(stage = %id, "Stage waiting for gate decision");
                let report = self.gates().present(manifest, id).await?;
                return Ok(RunOutcome::AwaitingGate(report));
            }

            match self.execute(stage, manifest).await? {
                Ok(()) => {
                    let report = self.gates().present(manifest, id).await?;
                    return Ok(RunOutcome::AwaitingGate(report));
                }
                Err(failure) => {
                    return Ok(RunOutcome::Failed {
                        stage: id,
                        error: failure,
                    })
                }
            }
        }

        if manifest.current_stage != CurrentStage::Complete {
            manifest.refresh_current_stage();
            self.store.save(manifest)?;
        }
        info!("Pipeline complete");
        Ok(RunOutcome::Complete)
    }

    /// Rewind `stage` and every later stage to pending, then run
    #[instrument(skip(self, manifest), fields(episode = %manifest.episode.id))]
    pub async fn run_from(&self, manifest: &mut Manifest, stage: StageId) -> Result<RunOutcome> {
        let rewound: Vec<StageId> = stage.and_later().collect();
        for &s in &rewound {
            let record = manifest.stage_mut(s);
            if record.status != StageStatus::Pending {
                warn!(stage = %s, status = %record.status, "Rewinding stage");
            }
            record.reset();
        }
        manifest.refresh_current_stage();
        self.store.save(manifest)?;
        for s in rewound {
            self.store.discard(s).await?;
        }

        self.run(manifest).await
    }

    /// Delegate a human decision to the gate controller
    pub async fn apply_gate_decision(
        &self,
        manifest: &mut Manifest,
        decision: &GateDecision,
    ) -> std::result::Result<GateEffect, GateError> {
        self.gates().apply(manifest, decision).await
    }

    /// A stage left `in_progress` belongs to a process that died mid-stage.
    /// Its staging output is already swept; it simply runs again.
    fn recover_interrupted(&self, manifest: &mut Manifest) -> Result<()> {
        let mut changed = false;
        for record in manifest.stages.iter_mut() {
            if record.status == StageStatus::InProgress {
                warn!(stage = %record.stage, "Stage was interrupted, it will run again");
                record.reset();
                changed = true;
            }
        }
        if changed {
            manifest.refresh_current_stage();
            self.store.save(manifest)?;
        }
        Ok(())
    }

    /// Execute one stage with checkpointing.
    ///
    /// The outer error is a persistence failure of the session itself; the
    /// inner one is the stage's classified failure, already recorded.
    #[instrument(skip_all, fields(stage = %stage.id()))]
    async fn execute(
        &self,
        stage: &Arc<dyn Stage>,
        manifest: &mut Manifest,
    ) -> Result<std::result::Result<(), StageFailure>> {
        let id = stage.id();

        if let Err(failure) = check_disk(self.store.session_dir(), self.limits.min_free_disk_bytes()) {
            error!(error = %failure, "Not enough resources to start stage");
            return Ok(Err(failure));
        }

        let record = manifest.stage_mut(id);
        record.reset();
        record.status = StageStatus::InProgress;
        record.started_at = Some(Utc::now());
        manifest.current_stage = id.into();
        self.store.save(manifest)?;
        info!("Stage started");

        let staging = self.store.create_staging(id).await?;
        let mut ctx = StageContext::new(
            self.store.session_dir().to_path_buf(),
            manifest.clone(),
            staging.clone(),
            self.providers.clone(),
            self.retry.clone(),
            self.limits.clone(),
        );

        // Own task, so a panic inside a stage is a failure and not a crash
        let task = {
            let stage = stage.clone();
            tokio::spawn(async move {
                let result = stage.run(&mut ctx).await;
                (ctx, result)
            })
        };
        let (last_step, mut result) = match task.await {
            Ok((ctx, result)) => (ctx.last_completed_step().map(str::to_string), result),
            Err(e) => (
                None,
                Err(StageFailure::consistency("unknown", format!("stage task failed: {}", e))),
            ),
        };

        if result.is_ok() {
            for key in stage.required_outputs() {
                if !tokio::fs::try_exists(staging.join(key.file_name())).await.unwrap_or(false) {
                    result = Err(StageFailure::consistency(
                        "checkpoint",
                        format!("stage finished without writing {}", key.file_name()),
                    ));
                    break;
                }
            }
        }

        match result {
            Ok(()) => {
                let checksums = self.store.promote(&staging, id).await?;
                for key in ArtifactKey::for_stage(id) {
                    manifest.artifacts.insert(key, key.default_path());
                }

                let record = manifest.stage_mut(id);
                record.status = StageStatus::Completed;
                record.completed_at = Some(Utc::now());
                record.artifact_checksums = checksums;
                record.last_completed_step = last_step;
                record.error = None;
                manifest.refresh_current_stage();
                self.store.save(manifest)?;

                info!(artifacts = manifest.stage(id).artifact_checksums.len(), "Stage completed");
                Ok(Ok(()))
            }
            Err(failure) => {
                if let Err(e) = self.store.discard_staging(&staging).await {
                    warn!(error = %e, "Failed to remove staging directory");
                }

                if failure.leaves_manifest_untouched() {
                    // Stays in_progress; the next run recovers it
                    error!(error = %failure, "Stage ran out of resources");
                    return Ok(Err(failure));
                }

                let record = manifest.stage_mut(id);
                record.status = StageStatus::Failed;
                record.error = Some(failure.to_record());
                record.last_completed_step = last_step;
                self.store.save(manifest)?;

                error!(kind = %failure.kind, step = %failure.step, error = %failure.message, "Stage failed");
                Ok(Err(failure))
            }
        }
    }
}
