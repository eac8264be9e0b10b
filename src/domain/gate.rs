//! Human decisions at stage boundaries and the report they are made from.

use serde::{Deserialize, Serialize};

use super::edl::OperationPatch;
use super::manifest::StageId;

/// What the reviewer decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GateAction {
    Approve,
    /// Reject this stage, or roll back to an earlier `target`
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<StageId>,
    },
    /// Keep the stage but rewrite part of its output
    Modify { patch: OperationPatch },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub stage: StageId,
    #[serde(flatten)]
    pub action: GateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl GateDecision {
    pub fn approve(stage: StageId) -> Self {
        Self {
            stage,
            action: GateAction::Approve,
            notes: None,
        }
    }

    pub fn reject(stage: StageId, target: Option<StageId>) -> Self {
        Self {
            stage,
            action: GateAction::Reject { target },
            notes: None,
        }
    }

    pub fn modify(stage: StageId, patch: OperationPatch) -> Self {
        Self {
            stage,
            action: GateAction::Modify { patch },
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Whether an automated decision already took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    AutoApplied,
    RequiresApproval,
}

/// One automated decision exposed to the reviewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Operation id, track name or other stable handle
    pub subject: String,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub stage: StageId,
    pub summary: Vec<String>,
    pub items: Vec<ReviewItem>,
}

impl GateReport {
    pub fn requiring_approval(&self) -> impl Iterator<Item = &ReviewItem> {
        self.items
            .iter()
            .filter(|i| i.status == ReviewStatus::RequiresApproval)
    }

    pub fn auto_applied(&self) -> impl Iterator<Item = &ReviewItem> {
        self.items
            .iter()
            .filter(|i| i.status == ReviewStatus::AutoApplied)
    }
}
