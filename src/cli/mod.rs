//! Command-line interface for podflow.
//!
//! Provides commands for scaffolding a session, running the pipeline up to
//! the next human gate, deciding gates, and inspecting session state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::adapters::Providers;
use crate::config;
use crate::core::{GateEffect, Orchestrator, RunOutcome, SessionStore};
use crate::domain::edl::OperationPatch;
use crate::domain::gate::{GateDecision, GateReport, ReviewStatus};
use crate::domain::manifest::{Manifest, Role, StageId, StageStatus, MANIFEST_FILE};

pub mod init;

/// podflow - Checkpointed podcast post-production pipeline
#[derive(Parser, Debug)]
#[command(name = "podflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a session directory with its tracks and manifest
    Init {
        /// Episode title
        #[arg(long)]
        title: String,

        /// Show name
        #[arg(long)]
        show: String,

        /// Episode number
        #[arg(long)]
        episode: u32,

        /// Recording date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Participant tracks (paths or glob patterns), one per speaker
        #[arg(long, num_args = 1.., required = true)]
        tracks: Vec<String>,

        /// Participant names, in track order
        #[arg(long, num_args = 1..)]
        names: Vec<String>,

        /// Participant roles (host, co-host, guest), in track order
        #[arg(long, num_args = 1..)]
        roles: Vec<Role>,

        /// Session sample rate in Hz
        #[arg(long, default_value_t = init::DEFAULT_SAMPLE_RATE)]
        sample_rate: u32,

        /// Session directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Run the pipeline until the next gate, a failure or the end
    Run {
        /// Manifest of the session
        #[arg(short, long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,

        /// Rewind this stage and every later one, then run
        #[arg(long)]
        from: Option<StageId>,
    },

    /// Show or decide the pending gate
    Gate {
        /// Manifest of the session
        #[arg(short, long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,

        #[command(subcommand)]
        action: Option<GateCommand>,
    },

    /// Show the state of every stage
    Status {
        /// Manifest of the session
        #[arg(short, long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum GateCommand {
    /// Approve the stage waiting at its gate
    Approve {
        #[arg(long)]
        notes: Option<String>,
    },

    /// Reject the stage, optionally rolling back to an earlier one
    Reject {
        /// Earliest stage to run again
        #[arg(long)]
        to: Option<StageId>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Patch the edit list and approve editing
    Modify {
        /// YAML or JSON patch with `replace`, `prune` and `accept`
        #[arg(long)]
        edits: PathBuf,

        #[arg(long)]
        notes: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init {
                title,
                show,
                episode,
                date,
                tracks,
                names,
                roles,
                sample_rate,
                output,
            } => {
                let spec = init::SessionSpec {
                    show,
                    title,
                    episode_number: episode,
                    recording_date: date,
                    tracks,
                    names,
                    roles,
                    sample_rate,
                };
                init_session(&output, &spec).await
            }
            Commands::Run { manifest, from } => run_pipeline(&manifest, from).await,
            Commands::Gate { manifest, action } => match action {
                None => show_gate(&manifest).await,
                Some(action) => decide_gate(&manifest, action).await,
            },
            Commands::Status { manifest } => show_status(&manifest).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Build an orchestrator for the session owning `manifest_path`
async fn open_session(manifest_path: &Path) -> Result<(Orchestrator, Manifest)> {
    let cfg = config::config()?;
    let store = SessionStore::open(manifest_path);
    let manifest = store.load().await?;
    let orchestrator = Orchestrator::new(
        store,
        Providers::from_config(cfg),
        cfg.retry.clone(),
        cfg.limits.clone(),
    );
    Ok((orchestrator, manifest))
}

async fn init_session(dir: &Path, spec: &init::SessionSpec) -> Result<()> {
    let manifest = init::scaffold(dir, spec).await?;

    println!("Created session {}", manifest.episode.id);
    println!("  Manifest: {}", dir.join(MANIFEST_FILE).display());
    for p in &manifest.episode.participants {
        println!("  {:<16} {:<8} {}", p.name, role_label(p.role), p.track.display());
    }
    println!("\nNext: podflow run -m {}", dir.join(MANIFEST_FILE).display());
    Ok(())
}

/// Run the pipeline and report where it stopped
async fn run_pipeline(manifest_path: &Path, from: Option<StageId>) -> Result<()> {
    let (orchestrator, mut manifest) = open_session(manifest_path).await?;

    let outcome = match from {
        Some(stage) => orchestrator.run_from(&mut manifest, stage).await?,
        None => orchestrator.run(&mut manifest).await?,
    };

    match outcome {
        RunOutcome::AwaitingGate(report) => {
            print_report(&report);
            eprintln!(
                "\n[Stage {} completed, waiting for: podflow gate approve | reject | modify]",
                report.stage
            );
        }
        RunOutcome::Failed { stage, error } => {
            eprintln!("\n[Stage {} failed: {}]", stage, error);
            std::process::exit(1);
        }
        RunOutcome::Complete => {
            eprintln!("\n[Episode {} complete]", manifest.episode.id);
        }
    }

    Ok(())
}

/// Print the report of the pending gate
async fn show_gate(manifest_path: &Path) -> Result<()> {
    let (orchestrator, manifest) = open_session(manifest_path).await?;

    match orchestrator.gates().present_pending(&manifest).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Apply a human decision to the pending gate
async fn decide_gate(manifest_path: &Path, action: GateCommand) -> Result<()> {
    let (orchestrator, mut manifest) = open_session(manifest_path).await?;

    // A failed stage has no pending gate but may still be rejected
    let stage = manifest.pending_gate().or_else(|| match &action {
        GateCommand::Reject { .. } => manifest
            .current_stage
            .stage()
            .filter(|s| manifest.stage(*s).status == StageStatus::Failed),
        _ => None,
    });
    let Some(stage) = stage else {
        eprintln!("{}", crate::core::GateError::NoPendingGate);
        std::process::exit(1);
    };

    let (decision, notes) = match action {
        GateCommand::Approve { notes } => (GateDecision::approve(stage), notes),
        GateCommand::Reject { to, notes } => (GateDecision::reject(stage, to), notes),
        GateCommand::Modify { edits, notes } => {
            let patch = load_patch(&edits)?;
            (GateDecision::modify(stage, patch), notes)
        }
    };
    let decision = match notes {
        Some(notes) => decision.with_notes(notes),
        None => decision,
    };

    match orchestrator.apply_gate_decision(&mut manifest, &decision).await {
        Ok(GateEffect::Applied) => {
            eprintln!("[Gate decision recorded for {}]", stage);
            match manifest.current_stage.stage() {
                Some(next) => eprintln!("Next stage to run: {} (podflow run)", next),
                None => eprintln!("Episode {} is complete", manifest.episode.id),
            }
            Ok(())
        }
        Ok(GateEffect::NoChange) => {
            eprintln!("[Decision already in effect for {}; nothing changed]", stage);
            Ok(())
        }
        Err(e) => {
            eprintln!("Gate decision failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Read an edit patch; JSON when the extension says so, YAML otherwise
fn load_patch(path: &Path) -> Result<OperationPatch> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read edit patch: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse edit patch: {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse edit patch: {}", path.display()))
    }
}

/// Show the status of every stage
async fn show_status(manifest_path: &Path) -> Result<()> {
    let store = SessionStore::open(manifest_path);
    let manifest = store.load().await?;
    let episode = &manifest.episode;

    println!("Episode: {} ({})", episode.title, episode.id);
    println!("Show: {}, episode {}", episode.show, episode.episode_number);
    if let Some(date) = episode.recording_date {
        println!("Recorded: {}", date);
    }
    println!("Sample rate: {} Hz", manifest.sample_rate);
    println!("Participants:");
    for p in &episode.participants {
        println!("  {:<16} {:<8} {}", p.name, role_label(p.role), p.track.display());
    }
    println!("Current stage: {}", manifest.current_stage);
    println!();

    println!("  {:<12} {:<12} {:<10} {:<20} {:<20}", "STAGE", "STATUS", "GATE", "STARTED", "COMPLETED");
    println!("  {}", "-".repeat(76));
    for record in &manifest.stages {
        let marker = if manifest.current_stage.stage() == Some(record.stage) { ">" } else { " " };
        println!(
            "{} {:<12} {:<12} {:<10} {:<20} {:<20}",
            marker,
            record.stage.as_str(),
            record.status.to_string(),
            record.gate.to_string(),
            record
                .started_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            record
                .completed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if let Some(error) = &record.error {
            println!("    error: {} at step '{}': {}", error.kind, error.step, error.message);
        }
        if let Some(notes) = &record.gate_notes {
            println!("    notes: {}", notes);
        }
    }

    if let Some(stage) = manifest.pending_gate() {
        println!("\nStage {} is waiting for a gate decision (podflow gate)", stage);
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let providers = Providers::from_config(cfg);

    println!("podflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home: {}", cfg.home.display());
    println!();
    println!("Providers: {}", providers.describe());
    println!("Binaries:");
    println!("  whisper: {}", cfg.binaries.whisper);
    println!("  ffmpeg:  {}", cfg.binaries.ffmpeg);
    println!("  ffprobe: {}", cfg.binaries.ffprobe);
    if let Some(url) = &cfg.analysis_url {
        println!("Analysis service: {}", url);
    }
    println!();
    println!("Retry:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!();
    println!("Limits:");
    println!("  Workers:        {}", cfg.limits.workers);
    println!("  Call timeout:   {}s", cfg.limits.call_timeout_seconds);
    println!("  Call budget:    {}s", cfg.limits.stage_budget_seconds);
    println!("  Min free disk:  {} MB", cfg.limits.min_free_disk_mb);

    Ok(())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Host => "host",
        Role::CoHost => "co-host",
        Role::Guest => "guest",
    }
}

fn print_report(report: &GateReport) {
    println!("Gate: {}", report.stage);
    for line in &report.summary {
        println!("  {}", line);
    }

    let pending: Vec<_> = report.requiring_approval().collect();
    let applied = report.auto_applied().count();
    println!("\n{} auto-applied, {} requiring approval", applied, pending.len());

    for item in &report.items {
        let status = match item.status {
            ReviewStatus::AutoApplied => "auto",
            ReviewStatus::RequiresApproval => "REVIEW",
        };
        let confidence = item
            .confidence
            .map(|c| format!("{:.2}", c))
            .unwrap_or_else(|| "-".to_string());
        println!("  [{:<6}] {:<20} {:>5}  {}", status, item.subject, confidence, item.rationale);
    }
}
