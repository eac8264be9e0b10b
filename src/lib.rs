//! podflow - Checkpointed podcast post-production pipeline
//!
//! Turns the isolated per-speaker tracks of a recording session into a
//! mastered episode through four stages: ingestion, editing, mixing and
//! mastering.
//!
//! # Architecture
//!
//! The system is built around a session manifest:
//! - Every stage writes its outputs to staging and promotes them as a unit
//! - The manifest records each checkpoint with write-temp-then-rename
//! - A human gate after every stage approves, rejects or patches its output
//! - An interrupted or failed run resumes from the last checkpoint
//!
//! # Modules
//!
//! - `adapters`: External collaborators behind capability traits
//! - `align`: Signal Aligner (cross-correlation and transcript matching)
//! - `timeline`: Timeline Builder, Edit Executor and CMX 3600 export
//! - `stages`: The four pipeline stages
//! - `core`: Orchestrator, Gate Controller, session store, retry
//! - `domain`: Manifest and artifact data structures
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create a session
//! podflow init --show "The Rust Hour" --episode 12 --title "Lifetimes" \
//!     --tracks raw/*.wav --names alice bob -o ep12
//!
//! # Run until the next gate, then decide it
//! podflow run -m ep12/manifest.yaml
//! podflow gate -m ep12/manifest.yaml approve
//!
//! # Check progress
//! podflow status -m ep12/manifest.yaml
//! ```

pub mod adapters;
pub mod align;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;
pub mod timeline;

// Re-export main types at crate root for convenience
pub use core::{GateController, Orchestrator, RunOutcome, SessionStore, StageFailure};
pub use domain::{EditList, GateDecision, Manifest, StageId};
