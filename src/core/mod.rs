//! Core orchestration logic.
//!
//! This module contains:
//! - Orchestrator: stage sequencing and checkpointing
//! - Gate: review reports and human decisions
//! - Store: session directory persistence
//! - Retry, Error, Resources: the policies every stage runs under

pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod resources;
pub mod retry;
pub mod store;

// Re-export commonly used types
pub use error::StageFailure;
pub use gate::{GateController, GateEffect, GateError};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use retry::RetryPolicy;
pub use store::SessionStore;
