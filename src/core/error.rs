//! Classified stage failures.
//!
//! Everything that goes wrong inside a stage is turned into a
//! [`StageFailure`] at the stage boundary, carrying the kind, a message and
//! the step that failed. The orchestrator writes it into the stage record.

use std::io;

use thiserror::Error;

use crate::adapters::ProviderError;
use crate::domain::manifest::{ErrorKind, ManifestError, StageError};
use crate::timeline::{ExecutorError, TimelineError};

#[derive(Debug, Clone, Error)]
#[error("{kind} at step '{step}': {message}")]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub step: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: step.into(),
        }
    }

    pub fn input(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputValidation, step, message)
    }

    pub fn consistency(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConsistencyViolation, step, message)
    }

    pub fn resources(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhaustion, step, message)
    }

    /// The manifest must not be touched after this kind of failure
    pub fn leaves_manifest_untouched(&self) -> bool {
        self.kind == ErrorKind::ResourceExhaustion
    }

    pub fn to_record(&self) -> StageError {
        StageError {
            kind: self.kind,
            message: self.message.clone(),
            step: self.step.clone(),
        }
    }
}

/// Errors that know which failure kind they belong to
pub trait Classify: std::fmt::Display {
    fn kind(&self) -> ErrorKind;
}

/// Classify an I/O error by what it says about the environment
pub fn io_kind(e: &io::Error) -> ErrorKind {
    // ENOSPC, EDQUOT
    if matches!(e.raw_os_error(), Some(28) | Some(122)) {
        return ErrorKind::ResourceExhaustion;
    }
    match e.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof => ErrorKind::InputValidation,
        io::ErrorKind::StorageFull | io::ErrorKind::OutOfMemory => ErrorKind::ResourceExhaustion,
        io::ErrorKind::TimedOut => ErrorKind::TransientExternal,
        _ => ErrorKind::ConsistencyViolation,
    }
}

impl Classify for io::Error {
    fn kind(&self) -> ErrorKind {
        io_kind(self)
    }
}

impl Classify for serde_json::Error {
    fn kind(&self) -> ErrorKind {
        if self.is_io() {
            ErrorKind::ConsistencyViolation
        } else {
            ErrorKind::InputValidation
        }
    }
}

impl Classify for ManifestError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InputValidation
    }
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Only reaches a stage boundary once retries ran out
            ProviderError::Transient { .. } => ErrorKind::TransientExternal,
            ProviderError::InvalidInput { .. } | ProviderError::Unsupported { .. } => {
                ErrorKind::InputValidation
            }
            ProviderError::Permanent { .. } => ErrorKind::ConsistencyViolation,
            ProviderError::Io(e) => io_kind(e),
        }
    }
}

impl Classify for TimelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            TimelineError::InvalidInterval { .. } => ErrorKind::InputValidation,
            TimelineError::OverlappingKeeps { .. } | TimelineError::UnknownTrack { .. } => {
                ErrorKind::ConsistencyViolation
            }
        }
    }
}

impl Classify for ExecutorError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::MissingTrack(_) => ErrorKind::InputValidation,
            ExecutorError::Extract { source, .. } => source.kind(),
            ExecutorError::Worker(_) => ErrorKind::ConsistencyViolation,
        }
    }
}

/// Attach the failing step to a classified error
pub trait AtStep<T> {
    fn at_step(self, step: &str) -> Result<T, StageFailure>;
}

impl<T, E: Classify> AtStep<T> for Result<T, E> {
    fn at_step(self, step: &str) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure::new(e.kind(), step, e.to_string()))
    }
}

/// Classify an untyped error by inspecting its cause chain
pub fn classify_anyhow(step: &str, error: &anyhow::Error) -> StageFailure {
    for cause in error.chain() {
        if let Some(failure) = cause.downcast_ref::<StageFailure>() {
            return failure.clone();
        }
        let kind = if let Some(e) = cause.downcast_ref::<io::Error>() {
            Some(io_kind(e))
        } else if let Some(e) = cause.downcast_ref::<ProviderError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<TimelineError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<ExecutorError>() {
            Some(e.kind())
        } else if cause.downcast_ref::<serde_json::Error>().is_some()
            || cause.downcast_ref::<ManifestError>().is_some()
        {
            Some(ErrorKind::InputValidation)
        } else {
            None
        };
        if let Some(kind) = kind {
            return StageFailure::new(kind, step, format!("{:#}", error));
        }
    }
    StageFailure::consistency(step, format!("{:#}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_io_classification() {
        assert_eq!(
            io_kind(&io::Error::from(io::ErrorKind::NotFound)),
            ErrorKind::InputValidation
        );
        assert_eq!(
            io_kind(&io::Error::from_raw_os_error(28)),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            io_kind(&io::Error::from(io::ErrorKind::TimedOut)),
            ErrorKind::TransientExternal
        );
        assert_eq!(
            io_kind(&io::Error::from(io::ErrorKind::PermissionDenied)),
            ErrorKind::ConsistencyViolation
        );
    }

    #[test]
    fn test_at_step_carries_step() {
        let result: Result<(), ProviderError> =
            Err(ProviderError::transient("whisper", "rate limited"));
        let failure = result.at_step("transcribe").unwrap_err();

        assert_eq!(failure.kind, ErrorKind::TransientExternal);
        assert_eq!(failure.step, "transcribe");
        assert!(failure.message.contains("rate limited"));
    }

    #[test]
    fn test_classify_anyhow_walks_chain() {
        let err = Err::<(), _>(io::Error::from(io::ErrorKind::NotFound))
            .context("Failed to open track")
            .unwrap_err();
        let failure = classify_anyhow("validate", &err);

        assert_eq!(failure.kind, ErrorKind::InputValidation);
        assert!(failure.message.contains("Failed to open track"));
    }

    #[test]
    fn test_resource_exhaustion_skips_manifest() {
        assert!(StageFailure::resources("preflight", "disk full").leaves_manifest_untouched());
        assert!(!StageFailure::input("load", "missing").leaves_manifest_untouched());
    }
}
