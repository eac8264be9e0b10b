//! Edit decision list: the rich internal form.
//!
//! Operations address a track's own source clock in ticks. Only applied
//! operations reach the timeline; proposals wait in the list for review.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::span::TickSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Keep,
    Cut,
}

/// What produced a cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutOrigin {
    Filler,
    Silence,
    Tangent,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    /// Stable id, referenced by gate patches
    pub id: String,

    pub kind: OperationKind,

    /// Participant name owning the source track
    pub track: String,

    /// Source interval in ticks
    pub span: TickSpan,

    /// False for proposals awaiting approval
    #[serde(default = "default_applied")]
    pub applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<CutOrigin>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    #[serde(default)]
    pub requires_review: bool,
}

fn default_applied() -> bool {
    true
}

impl EditOperation {
    pub fn keep(id: impl Into<String>, track: impl Into<String>, span: TickSpan) -> Self {
        Self {
            id: id.into(),
            kind: OperationKind::Keep,
            track: track.into(),
            span,
            applied: true,
            origin: None,
            confidence: None,
            rationale: None,
            requires_review: false,
        }
    }

    pub fn cut(id: impl Into<String>, track: impl Into<String>, span: TickSpan) -> Self {
        Self {
            kind: OperationKind::Cut,
            ..Self::keep(id, track, span)
        }
    }

    /// Operation ids are `<group>/<track>` when one decision was applied to
    /// every track; a patch may address either the full id or the group.
    pub fn selected_by(&self, id: &str) -> bool {
        self.id == id
            || self
                .id
                .strip_prefix(id)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.span.end <= self.span.start {
            return Err(format!(
                "operation {} has end {} <= start {}",
                self.id, self.span.end, self.span.start
            ));
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(format!(
                    "operation {} has confidence {} outside [0, 1]",
                    self.id, c
                ));
            }
        }
        Ok(())
    }
}

/// Chapter marker on the output clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditList {
    pub sample_rate: u32,
    pub frame_rate: u32,
    pub operations: Vec<EditOperation>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl EditList {
    pub fn applied(&self) -> impl Iterator<Item = &EditOperation> {
        self.operations.iter().filter(|op| op.applied)
    }

    pub fn proposals(&self) -> impl Iterator<Item = &EditOperation> {
        self.operations.iter().filter(|op| !op.applied)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for op in &self.operations {
            op.validate()?;
            if !seen.insert(op.id.as_str()) {
                return Err(format!("duplicate operation id {}", op.id));
            }
        }
        Ok(())
    }

    /// Apply a human patch; returns how many operations changed
    pub fn apply_patch(&mut self, patch: &OperationPatch) -> Result<usize, String> {
        let mut changed = 0;

        if let Some(replacement) = &patch.replace {
            if *replacement != self.operations {
                changed += replacement.len().max(self.operations.len());
                self.operations = replacement.clone();
            }
        }

        for id in &patch.prune {
            let before = self.operations.len();
            self.operations.retain(|op| !op.selected_by(id));
            changed += before - self.operations.len();
        }

        for id in &patch.accept {
            let mut found = false;
            for op in self.operations.iter_mut().filter(|op| op.selected_by(id)) {
                found = true;
                if !op.applied || op.requires_review {
                    op.applied = true;
                    op.requires_review = false;
                    changed += 1;
                }
            }
            if !found {
                return Err(format!("cannot accept unknown operation {}", id));
            }
        }

        self.validate()?;
        Ok(changed)
    }
}

/// Replacement or pruned operation set supplied with a `modify` decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationPatch {
    /// Replace the whole operation list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<Vec<EditOperation>>,

    /// Operation ids to drop
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prune: Vec<String>,

    /// Proposal ids to apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept: Vec<String>,
}

impl OperationPatch {
    pub fn is_empty(&self) -> bool {
        self.replace.is_none() && self.prune.is_empty() && self.accept.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> EditList {
        let mut proposal = EditOperation::cut("op-0003", "guest", TickSpan::new(500, 900));
        proposal.applied = false;
        proposal.requires_review = true;

        EditList {
            sample_rate: 1_000,
            frame_rate: 30,
            operations: vec![
                EditOperation::keep("op-0001", "guest", TickSpan::new(0, 10_000)),
                EditOperation::cut("op-0002", "guest", TickSpan::new(100, 200)),
                proposal,
            ],
            chapters: Vec::new(),
        }
    }

    #[test]
    fn test_applied_filters_proposals() {
        let l = list();
        assert_eq!(l.applied().count(), 2);
        assert_eq!(l.proposals().count(), 1);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let patch = OperationPatch {
            prune: vec!["op-0002".into()],
            accept: vec!["op-0003".into()],
            ..Default::default()
        };

        let mut l = list();
        assert_eq!(l.apply_patch(&patch).unwrap(), 2);
        let once = l.clone();

        assert_eq!(l.apply_patch(&patch).unwrap(), 0);
        assert_eq!(l, once);
        assert!(l.operations.iter().all(|op| op.applied));
    }

    #[test]
    fn test_patch_accept_unknown_fails() {
        let patch = OperationPatch {
            accept: vec!["op-9999".into()],
            ..Default::default()
        };
        assert!(list().apply_patch(&patch).is_err());
    }

    #[test]
    fn test_group_id_selects_every_track() {
        let mut a = EditOperation::cut("cut-0007/alice", "alice", TickSpan::new(0, 10));
        a.applied = false;
        let mut b = EditOperation::cut("cut-0007/bob", "bob", TickSpan::new(0, 10));
        b.applied = false;
        let other = EditOperation::cut("cut-00070/bob", "bob", TickSpan::new(20, 30));

        let mut l = EditList {
            sample_rate: 1_000,
            frame_rate: 30,
            operations: vec![a, b, other],
            chapters: Vec::new(),
        };
        let patch = OperationPatch {
            accept: vec!["cut-0007".into()],
            ..Default::default()
        };
        assert_eq!(l.apply_patch(&patch).unwrap(), 2);
        assert!(l.operations[..2].iter().all(|op| op.applied));
    }

    #[test]
    fn test_inverted_interval_rejected() {
        let op = EditOperation::keep("x", "host", TickSpan::new(10, 10));
        assert!(op.validate().is_err());
    }
}
