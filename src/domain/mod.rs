//! Domain types for podflow.
//!
//! Everything persisted by the pipeline lives here:
//! - Manifest: the session document and its stage records
//! - Alignment, Transcript, Context: ingestion artifacts
//! - EditList: the rich edit decision list
//! - TimelineRegion: resolved regions handed to the executor
//! - Gate: human decisions and review reports

pub mod alignment;
pub mod context;
pub mod edl;
pub mod gate;
pub mod manifest;
pub mod settings;
pub mod span;
pub mod timeline;
pub mod transcript;

// Re-export commonly used types
pub use alignment::{AlignmentAttempt, AlignmentMap, AlignmentMethod, AlignmentResult};
pub use context::{ContextDocument, SegmentKind, StructuralSegment, Topic};
pub use edl::{Chapter, CutOrigin, EditList, EditOperation, OperationKind, OperationPatch};
pub use gate::{GateAction, GateDecision, GateReport, ReviewItem, ReviewStatus};
pub use manifest::{
    ArtifactKey, CurrentStage, Episode, ErrorKind, GateOutcome, Manifest, ManifestError,
    Participant, Role, StageError, StageId, StageRecord, StageStatus,
};
pub use settings::StageConfigs;
pub use span::TickSpan;
pub use timeline::{TimelineRegion, Transition};
pub use transcript::{Segment, Transcript, Word};
